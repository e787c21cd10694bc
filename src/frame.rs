//! Frame — the wire protocol between whiteboard clients and the relay.
//!
//! ARCHITECTURE
//! ============
//! Every websocket text message is one JSON object with a `type`
//! discriminator. Inbound and outbound directions are separate closed enums:
//! a client can only send `draw`, `cursor`, `clearCanvas` and `undoRedo`;
//! presence and session-load frames only ever flow from the relay.
//!
//! DESIGN
//! ======
//! Parsing happens in two steps so protocol errors are classified: the raw
//! JSON is read first, then the `type` tag is checked against the inbound
//! set, then the typed payload is decoded. Callers log and drop on error.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{DrawElement, Element};

// =============================================================================
// TYPES
// =============================================================================

/// Frame key holding the event discriminator.
pub const FRAME_TYPE: &str = "type";

/// Inbound `type` tags accepted from clients.
pub const CLIENT_EVENT_TYPES: [&str; 4] = ["draw", "cursor", "clearCanvas", "undoRedo"];

/// Public identity of a connection, as announced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub username: String,
    pub color: String,
    pub initials: String,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    Draw { element: DrawElement },
    Cursor { x: f64, y: f64 },
    ClearCanvas,
    /// Full local element list after an undo or redo.
    UndoRedo { elements: Vec<DrawElement> },
}

impl ClientEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Draw { .. } => "draw",
            Self::Cursor { .. } => "cursor",
            Self::ClearCanvas => "clearCanvas",
            Self::UndoRedo { .. } => "undoRedo",
        }
    }
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    Draw {
        element: DrawElement,
    },
    #[serde(rename_all = "camelCase")]
    Cursor {
        x: f64,
        y: f64,
        user_id: Uuid,
        username: String,
        color: String,
    },
    UserJoin {
        user: UserInfo,
    },
    #[serde(rename_all = "camelCase")]
    UserLeave {
        user_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    LoadSession {
        session_id: i64,
        elements: Vec<Element>,
    },
    ClearCanvas,
    UndoRedo {
        elements: Vec<DrawElement>,
    },
}

impl ServerEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Draw { .. } => "draw",
            Self::Cursor { .. } => "cursor",
            Self::UserJoin { .. } => "userJoin",
            Self::UserLeave { .. } => "userLeave",
            Self::LoadSession { .. } => "loadSession",
            Self::ClearCanvas => "clearCanvas",
            Self::UndoRedo { .. } => "undoRedo",
        }
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error only if an element payload cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} frame: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse one inbound websocket text message.
///
/// # Errors
///
/// Returns a [`FrameError`] describing why the frame must be dropped.
pub fn parse_client_event(text: &str) -> Result<ClientEvent, FrameError> {
    let raw: serde_json::Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    let Some(kind) = raw.get(FRAME_TYPE).and_then(serde_json::Value::as_str) else {
        return Err(FrameError::MissingType);
    };
    if !CLIENT_EVENT_TYPES.contains(&kind) {
        return Err(FrameError::UnknownType(kind.to_owned()));
    }
    let kind = kind.to_owned();
    serde_json::from_value(raw).map_err(|source| FrameError::Invalid { kind, source })
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
