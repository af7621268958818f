use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::models::record::{MatchedImage, RecordId};

/// Plain acknowledgement, optionally naming the record it created
#[derive(Debug, Serialize)]
pub(crate) struct MessageResponse {
    #[serde(skip)]
    status: StatusCode,
    pub(crate) message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) id: Option<RecordId>,
}

impl MessageResponse {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            message: message.into(),
            id: None,
        }
    }

    pub(crate) fn created(message: impl Into<String>, id: RecordId) -> Self {
        Self {
            status: StatusCode::CREATED,
            message: message.into(),
            id: Some(id),
        }
    }
}

impl IntoResponse for MessageResponse {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// Matches for a query image, best first
#[derive(Debug, Serialize)]
pub(crate) struct SearchResponse {
    pub(crate) results: Vec<MatchedImage>,
}

/// Liveness report
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` when the store answered
    pub status: &'static str,
    /// Crate version of the running server
    pub version: &'static str,
    /// Number of stored image records
    pub records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_carries_id_and_status() {
        let id = RecordId::from_stored("abc");
        let response = MessageResponse::created("stored", id);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body, serde_json::json!({ "message": "stored", "id": "abc" }));
        assert_eq!(response.into_response().status(), StatusCode::CREATED);
    }

    #[test]
    fn test_ok_omits_id() {
        let body = serde_json::to_value(MessageResponse::ok("received")).unwrap();
        assert_eq!(body, serde_json::json!({ "message": "received" }));
    }
}
