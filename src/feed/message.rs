//! Inbound frame handling.

use serde_json::Value;

/// Outcome of parsing one inbound text frame.
///
/// Feed frames are JSON, but the endpoint occasionally pushes bare status
/// strings; those are delivered as [`Inbound::Raw`] rather than dropped, so
/// the consumer sees every frame exactly once, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The frame parsed as JSON.
    Parsed(Value),
    /// The frame was not valid JSON; the original text, unchanged.
    Raw(String),
}

impl Inbound {
    /// Parse a raw text frame, falling back to the raw text on failure.
    pub fn parse(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => Self::Parsed(value),
            Err(_) => Self::Raw(text),
        }
    }

    /// The parsed JSON value, if this frame parsed.
    pub fn json(&self) -> Option<&Value> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}
