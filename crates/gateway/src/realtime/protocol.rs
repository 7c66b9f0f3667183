//! Realtime wire protocol
//!
//! Every frame in both directions is a JSON object `{"event": .., "data": ..}`.
//! Outbound session events use the same envelope, see
//! [`SessionEvent`](parley_common::events::SessionEvent).

use parley_common::errors::{AppError, ErrorCode};
use parley_common::session::SessionKind;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Frames a connected party may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    CreateRequest(CreateRequest),
    Confirm(SessionRef),
    Join(SessionRef),
    End(SessionRef),
    Reject(SessionRef),
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::CreateRequest(_) => "createRequest",
            ClientFrame::Confirm(_) => "confirm",
            ClientFrame::Join(_) => "join",
            ClientFrame::End(_) => "end",
            ClientFrame::Reject(_) => "reject",
        }
    }

    pub fn validate(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            ClientFrame::CreateRequest(request) => request.validate(),
            ClientFrame::Confirm(target)
            | ClientFrame::Join(target)
            | ClientFrame::End(target)
            | ClientFrame::Reject(target) => target.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[validate(length(min = 1, max = 128))]
    pub provider_id: String,
    pub kind: SessionKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Bounded by `SessionIdGenerator::MAX_LENGTH`
    #[validate(length(min = 1, max = 64))]
    pub session_id: String,
}

/// Error reply sent to the connection that caused it
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        /// Inbound event that failed, when it could be parsed
        #[serde(skip_serializing_if = "Option::is_none")]
        request_event: Option<String>,
    },
}

impl ServerFrame {
    pub fn from_error(err: &AppError, request_event: Option<&str>) -> Self {
        ServerFrame::Error {
            code: err.code(),
            message: err.to_string(),
            request_event: request_event.map(str::to_string),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"error","data":{"code":"INTERNAL_ERROR","message":"unserializable frame"}}"#
                .to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::session::SessionIdGenerator;
    use serde_json::json;

    #[test]
    fn test_parses_create_request() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "createRequest",
            "data": { "providerId": "p-1", "kind": "audio" }
        }))
        .unwrap();

        assert_eq!(
            frame,
            ClientFrame::CreateRequest(CreateRequest {
                provider_id: "p-1".into(),
                kind: SessionKind::Audio,
            })
        );
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let parsed = serde_json::from_value::<ClientFrame>(json!({
            "event": "pause",
            "data": { "sessionId": "s-1" }
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_empty_session_id_fails_validation() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "end",
            "data": { "sessionId": "" }
        }))
        .unwrap();
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_longest_generated_id_passes_validation() {
        let generator = SessionIdGenerator::new(usize::MAX);
        let frame = ClientFrame::Join(SessionRef {
            session_id: generator.generate(),
        });
        assert!(frame.validate().is_ok());

        let oversized = ClientFrame::Join(SessionRef {
            session_id: "x".repeat(SessionIdGenerator::MAX_LENGTH + 1),
        });
        assert!(oversized.validate().is_err());
    }

    #[test]
    fn test_error_frame_shape() {
        let err = AppError::ProviderBusy {
            provider_id: "p-1".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&ServerFrame::from_error(&err, Some("createRequest")).to_json()).unwrap();

        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "PROVIDER_BUSY");
        assert_eq!(json["data"]["requestEvent"], "createRequest");
    }
}
