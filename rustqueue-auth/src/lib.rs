//! API key authorization for RustQueue
//!
//! Decides whether a credential may perform an operation class on a queue.
//! The queue engine consults an [`Authorizer`] before dispatching work but
//! owns none of the policy.

pub mod api_key;

pub use api_key::{ApiKeyAuthorizer, ApiKeyConfig, AuthError, API_KEYS_ENV};

use serde::{Deserialize, Serialize};

/// Operation classes a credential can be granted on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Delete,
    /// Queue info, health and clear
    Manage,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Manage => "manage",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Capability interface consumed by the queue engine
pub trait Authorizer: Send + Sync {
    /// Whether the credential is known at all
    fn authenticate(&self, credential: &str) -> bool;

    /// Whether the credential holds `capability` on `queue`
    fn authorize(&self, credential: &str, queue: &str, capability: Capability) -> Decision;
}

/// Authorizer used when authentication is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authenticate(&self, _credential: &str) -> bool {
        true
    }

    fn authorize(&self, _credential: &str, _queue: &str, _capability: Capability) -> Decision {
        Decision::Allow
    }
}
