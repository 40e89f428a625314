use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::telemetry::Counter;

/// Thumbnail request received from either queue.
///
/// The payload is identical for generation and deletion; the queue it
/// arrived on decides which one is meant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThumbRequest {
    pub thumb_request_id: Uuid,
    /// Path to the original file, relative to the originals root
    pub file_path: String,
}

/// Which queue a request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Generate,
    Delete,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Generate => "generate",
            RequestKind::Delete => "delete",
        }
    }

    /// Counter incremented when a request of this kind is received
    pub fn received_counter(&self) -> Counter {
        match self {
            RequestKind::Generate => Counter::ThumbGenRequestReceived,
            RequestKind::Delete => Counter::ThumbDelRequestReceived,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_thumb_request() {
        let json = r#"{
            "thumbRequestId": "550e8400-e29b-41d4-a716-446655440000",
            "filePath": "photos/2024/cat.png"
        }"#;

        let request: ThumbRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            request.thumb_request_id.to_string(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(request.file_path, "photos/2024/cat.png");
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        let json = r#"{"thumbRequestId": "not-a-uuid", "filePath": "cat.png"}"#;
        assert!(serde_json::from_str::<ThumbRequest>(json).is_err());
    }

    #[test]
    fn test_missing_file_path_rejected() {
        let json = r#"{"thumbRequestId": "550e8400-e29b-41d4-a716-446655440000"}"#;
        assert!(serde_json::from_str::<ThumbRequest>(json).is_err());
    }

    #[test]
    fn test_request_kind_counters() {
        assert_eq!(
            RequestKind::Generate.received_counter(),
            Counter::ThumbGenRequestReceived
        );
        assert_eq!(
            RequestKind::Delete.received_counter(),
            Counter::ThumbDelRequestReceived
        );
        assert_eq!(RequestKind::Delete.to_string(), "delete");
    }
}
