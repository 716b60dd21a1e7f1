//! Client-facing front-ends. All of them feed the same [`Streamer`].
//!
//! [`Streamer`]: crate::streamer::Streamer

pub mod grpc;
pub mod health;
pub mod http;
pub mod websocket;

use tokio::net::TcpListener;

use crate::error::{GatewayError, Result};

/// Binds `host:port`. Port 0 picks a free port.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let address = format!("{host}:{port}");
    TcpListener::bind(&address)
        .await
        .map_err(|source| GatewayError::Bind { address, source })
}

/// Cuts `reason` to the 123 bytes a WebSocket close frame can carry,
/// respecting character boundaries.
pub fn close_reason(reason: &str) -> String {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason.to_string();
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_fit_a_frame() {
        assert_eq!(close_reason("short"), "short");
        let long = "é".repeat(100);
        let cut = close_reason(&long);
        assert!(cut.len() <= 123);
        assert_eq!(cut.len() % 2, 0);
        assert!(long.starts_with(&cut));
    }

    #[tokio::test]
    async fn bind_failures_name_the_address() {
        let taken = bind("127.0.0.1", 0).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = bind("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, GatewayError::Bind { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }
}
