//! JSON form of requests, spoken by the HTTP and WebSocket front-ends.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use super::routes::to_datetime;
use super::{DataRequest, DataRequestBody, Document};
use crate::error::{GatewayError, Result};
use crate::params::{json_to_struct, struct_to_json};
use crate::proto::{DocumentProto, RouteProto, StatusProto};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonHeader {
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Base64, standard alphabet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Json>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
}

impl JsonDocument {
    fn into_document(self) -> Result<Document> {
        let blob = match self.blob {
            Some(encoded) => STANDARD.decode(encoded).map_err(|e| {
                GatewayError::BadRequest(format!("document `{}` has a bad blob: {e}", self.id))
            })?,
            None => Vec::new(),
        };
        Ok(DocumentProto {
            id: self.id,
            blob,
            text: self.text,
            tags: self.tags.as_ref().map(json_to_struct),
            mime_type: self.mime_type,
        }
        .into())
    }

    fn from_proto(doc: &DocumentProto) -> Self {
        Self {
            id: doc.id.clone(),
            text: doc.text.clone(),
            blob: (!doc.blob.is_empty()).then(|| STANDARD.encode(&doc.blob)),
            tags: doc.tags.as_ref().map(struct_to_json),
            mime_type: doc.mime_type.clone(),
        }
    }
}

/// Body of `POST /{endpoint}` and of `json` WebSocket messages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRequest {
    #[serde(default)]
    pub header: Option<JsonHeader>,
    #[serde(default)]
    pub data: Vec<JsonDocument>,
    #[serde(default)]
    pub parameters: Map<String, Json>,
    #[serde(default)]
    pub target_executor: Option<String>,
    #[serde(default)]
    pub exec_endpoint: Option<String>,
}

impl JsonRequest {
    /// Builds the request. An `exec_endpoint` in the body wins over the one
    /// taken from the URL path.
    pub fn into_request(self, path_endpoint: Option<&str>) -> Result<DataRequest> {
        let exec_endpoint = self
            .exec_endpoint
            .or_else(|| path_endpoint.map(normalize_endpoint))
            .unwrap_or_default();
        let mut body = DataRequestBody {
            parameters: (!self.parameters.is_empty()).then(|| json_to_struct(&self.parameters)),
            data: self
                .data
                .into_iter()
                .map(JsonDocument::into_document)
                .collect::<Result<_>>()?,
            target_executor: self.target_executor.unwrap_or_default(),
            exec_endpoint,
            ..Default::default()
        };
        if let Some(header) = self.header {
            body.set_request_id(header.request_id);
        }
        Ok(DataRequest::from_body(body))
    }
}

pub fn parse_request(raw: &[u8], path_endpoint: Option<&str>) -> Result<DataRequest> {
    let parsed: JsonRequest = serde_json::from_slice(raw)
        .map_err(|e| GatewayError::BadRequest(format!("malformed JSON request: {e}")))?;
    parsed.into_request(path_endpoint)
}

/// `{}` ends a WebSocket stream.
pub fn is_end_of_stream(raw: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<Json>(raw),
        Ok(Json::Object(map)) if map.is_empty()
    )
}

fn normalize_endpoint(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

pub fn status_to_json(status: &StatusProto) -> Json {
    let mut out = json!({
        "code": status.code().as_str_name(),
        "description": status.description,
    });
    if let Some(exception) = &status.exception {
        out["exception"] = json!({
            "name": exception.name,
            "args": exception.args,
            "stacks": exception.stacks,
            "executor": exception.executor,
        });
    }
    out
}

pub fn route_to_json(route: &RouteProto) -> Json {
    let time = |ts: &Option<prost_types::Timestamp>| {
        ts.as_ref()
            .and_then(to_datetime)
            .map(|t| Json::String(t.to_rfc3339()))
            .unwrap_or(Json::Null)
    };
    json!({
        "executor": route.executor,
        "start_time": time(&route.start_time),
        "end_time": time(&route.end_time),
        "pod_id": route.pod_id,
    })
}

/// `{header: {request_id, status}, routes, parameters, data}`.
pub fn to_json(body: &DataRequestBody) -> Json {
    let status = body.status.clone().unwrap_or_else(StatusProto::success);
    json!({
        "header": {
            "request_id": body.request_id(),
            "status": status_to_json(&status),
            "exec_endpoint": body.exec_endpoint,
            "target_executor": body.target_executor,
        },
        "routes": body.routes.iter().map(route_to_json).collect::<Vec<_>>(),
        "parameters": body.parameters.as_ref().map(struct_to_json).unwrap_or_default(),
        "data": body.data.iter().map(|doc| JsonDocument::from_proto(doc)).collect::<Vec<_>>(),
    })
}
