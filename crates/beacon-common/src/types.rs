//! Core types shared across Beacon components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Action reported by the store for a response or change event.
///
/// Unknown actions are preserved so that consumers can report them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StoreAction {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    Other(String),
}

impl StoreAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Expire => "expire",
            Self::CompareAndSwap => "compareAndSwap",
            Self::CompareAndDelete => "compareAndDelete",
            Self::Other(action) => action,
        }
    }

    /// Returns true if the action leaves a value at the key
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Set | Self::Create | Self::Update | Self::CompareAndSwap
        )
    }

    /// Returns true if the action removes the key
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Self::Delete | Self::Expire | Self::CompareAndDelete
        )
    }
}

impl From<&str> for StoreAction {
    fn from(action: &str) -> Self {
        match action {
            "get" => Self::Get,
            "set" => Self::Set,
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "expire" => Self::Expire,
            "compareAndSwap" => Self::CompareAndSwap,
            "compareAndDelete" => Self::CompareAndDelete,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for StoreAction {
    fn from(action: String) -> Self {
        Self::from(action.as_str())
    }
}

impl From<StoreAction> for String {
    fn from(action: StoreAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for StoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the store's key tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Full key path (the root directory has none)
    #[serde(default)]
    pub key: String,

    /// Value for leaf nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Is this a directory?
    #[serde(default)]
    pub dir: bool,

    /// Children (directories only; nested when listed recursively)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,

    /// Remaining time-to-live in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,

    /// RFC 3339 expiry time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,

    #[serde(default)]
    pub modified_index: u64,

    #[serde(default)]
    pub created_index: u64,
}

impl Node {
    /// Final path segment of the key
    pub fn name(&self) -> &str {
        leaf_name(&self.key)
    }

    /// Value, or the empty string for directories and deleted nodes
    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }
}

/// A store response or watch notification.
///
/// Both share one shape: what happened, to which node, and what was there
/// before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    pub action: StoreAction,

    pub node: Node,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,

    /// Store-wide index when the response was produced (from the response
    /// header, not the body)
    #[serde(skip)]
    pub index: u64,
}

/// Liveness transition derived from a store action on a token key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessTransition {
    /// A new token was created
    Registered,
    /// The token was renewed by its owner
    Renewed,
    /// The lease lapsed without renewal
    Expired,
    /// The owner deleted its token on shutdown
    Removed,
    /// The store reported an action this classifier does not know
    Unhandled(String),
}

impl LivenessTransition {
    /// Classify a store action on a liveness key
    pub fn classify(action: &StoreAction) -> Self {
        match action {
            StoreAction::Create => Self::Registered,
            StoreAction::CompareAndSwap => Self::Renewed,
            StoreAction::CompareAndDelete => Self::Removed,
            StoreAction::Expire => Self::Expired,
            other => Self::Unhandled(other.as_str().to_string()),
        }
    }

    /// Returns true if the server holds a live token after this transition
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Registered | Self::Renewed)
    }
}

/// A fleet event observed in the liveness namespace
#[derive(Debug, Clone, Serialize)]
pub struct LivenessEvent {
    /// Server name (final segment of the key)
    pub server: String,

    pub transition: LivenessTransition,

    /// Full key the event was observed on
    pub key: String,

    /// Token value carried by the event, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Unix timestamp (seconds) when the event was observed
    pub observed_at: i64,
}

impl LivenessEvent {
    pub fn from_key_event(event: &KeyEvent) -> Self {
        Self {
            server: event.node.name().to_string(),
            transition: LivenessTransition::classify(&event.action),
            key: event.node.key.clone(),
            token: event.node.value.clone(),
            observed_at: chrono::Utc::now().timestamp(),
        }
    }
}

impl fmt::Display for LivenessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transition {
            LivenessTransition::Registered => write!(f, "{} has started heart beat", self.server),
            LivenessTransition::Renewed => write!(f, "{} heart beat", self.server),
            LivenessTransition::Removed => write!(f, "{} has shut down correctly", self.server),
            LivenessTransition::Expired => write!(f, "*** {} has missed heartbeat", self.server),
            LivenessTransition::Unhandled(action) => {
                write!(f, "Didn't handle {} on {}", action, self.key)
            }
        }
    }
}

/// Final path segment of a key ("/running/s1" -> "s1")
pub fn leaf_name(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Check that a server or variable name is usable as a single key segment
pub fn is_valid_segment(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}
