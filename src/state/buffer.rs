//! Buffers: channels and query correspondents tracked on an upstream.

use serde::{Deserialize, Serialize};

/// A channel or private-message correspondent the user has state with.
///
/// Identity is case-insensitive on `name`; the owning map keys buffers by
/// their IRC-lowercased name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub joined: bool,
    #[serde(default)]
    pub topic: String,
    pub is_channel: bool,
    #[serde(default)]
    pub last_seen: i64,
}

impl Buffer {
    /// Create a buffer with empty membership state.
    pub fn new(name: impl Into<String>, is_channel: bool) -> Self {
        Self {
            name: name.into(),
            key: String::new(),
            joined: false,
            topic: String::new(),
            is_channel,
            last_seen: 0,
        }
    }
}
