//! Shared application state and whiteboard records.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the relay handle (the only path into live session state) and
//! the session store used by the HTTP layer for read-only and CRUD calls.
//! Durable mutations that clients can observe go through the relay so
//! they are ordered with websocket traffic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::services::relay::Relay;
use crate::services::store::SessionStore;

// =============================================================================
// SESSION
// =============================================================================

/// A named, persisted whiteboard. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

// =============================================================================
// ELEMENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Drawable element kinds. Wire names follow the client tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Freehand stroke.
    Pen,
    Line,
    Rectangle,
    Circle,
    Text,
    /// Eraser stroke.
    Eraser,
}

impl ElementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pen => "pen",
            Self::Line => "line",
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
            Self::Text => "text",
            Self::Eraser => "eraser",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pen" => Some(Self::Pen),
            "line" => Some(Self::Line),
            "rectangle" => Some(Self::Rectangle),
            "circle" => Some(Self::Circle),
            "text" => Some(Self::Text),
            "eraser" => Some(Self::Eraser),
            _ => None,
        }
    }
}

/// An element as drawn by a client. `id` is client-generated and opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default)]
    pub points: Vec<Point>,
    pub color: String,
    pub width: f64,
    /// Kind-specific payload, e.g. `{"text": "hello"}`.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// An element as held by the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Store-assigned, strictly increasing within a store.
    pub seq: i64,
    pub session_id: i64,
    pub created_at: i64,
    #[serde(flatten)]
    pub element: DrawElement,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub store: Arc<dyn SessionStore>,
}

impl AppState {
    #[must_use]
    pub fn new(relay: Relay, store: Arc<dyn SessionStore>) -> Self {
        Self { relay, store }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
