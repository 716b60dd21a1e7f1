use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/jina.proto");

    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);
    let well_known = protoc_bin_vendored::include_path()?;

    // Requests travel through the gateway as lazily decoded buffers, so the
    // two request messages are mapped onto our own types and carried by a
    // byte-level codec instead of prost.
    tonic_build::configure()
        .extern_path(".jina.DataRequestProto", "crate::request::DataRequest")
        .extern_path(
            ".jina.DataRequestListProto",
            "crate::request::DataRequestList",
        )
        .codec_path("crate::request::codec::LazyCodec")
        .compile_protos(
            &[PathBuf::from("proto/jina.proto")],
            &[PathBuf::from("proto"), well_known],
        )?;
    Ok(())
}
