// ABOUTME: Agent control-plane frame protocol — JSON text frames over the agent WebSocket
// ABOUTME: Defines Frame, FrameType, and constructors for requests, responses, and approvals

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame kind discriminator. Requests and responses are correlated by the
/// frame `id`, never by stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Req,
    Res,
    Stream,
    Event,
    ApprovalRequest,
    ApprovalResponse,
}

/// One unit of the agent-hub control protocol, serialized as a JSON text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Correlation ID for req/res/approval frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Method name for req frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request parameters for req frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Success flag for res frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Payload for res/stream/event frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error message for failed res frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    /// Build a request frame with the given correlation ID.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            frame_type: FrameType::Req,
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            ok: None,
            payload: None,
            error: None,
        }
    }

    /// Build a successful response frame.
    pub fn response(id: Option<String>, payload: Value) -> Self {
        Self {
            frame_type: FrameType::Res,
            id,
            method: None,
            params: None,
            ok: Some(true),
            payload: Some(payload),
            error: None,
        }
    }

    /// Build a failed response frame.
    pub fn error_response(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Res,
            id,
            method: None,
            params: None,
            ok: Some(false),
            payload: None,
            error: Some(error.into()),
        }
    }

    /// Build an approval_response frame answering an approval_request.
    pub fn approval_response(request_id: impl Into<String>, approved: bool) -> Self {
        Self {
            frame_type: FrameType::ApprovalResponse,
            id: Some(request_id.into()),
            method: None,
            params: None,
            ok: None,
            payload: Some(serde_json::json!({ "approved": approved })),
            error: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
