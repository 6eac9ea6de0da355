//! API key store and per-queue grants

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::{Authorizer, Capability, Decision};

/// Environment variable holding additional keys as JSON
pub const API_KEYS_ENV: &str = "RUSTQUEUE_API_KEYS_JSON";

/// Grant that applies to every queue
const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to read API key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid API key document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("API key must not be empty")]
    EmptyKey,
}

/// Grants held by one API key
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default)]
    pub description: String,
    /// queue name (or `*`) -> capabilities
    #[serde(default)]
    pub queues: HashMap<String, HashSet<Capability>>,
}

impl ApiKeyConfig {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            queues: HashMap::new(),
        }
    }

    pub fn grant(
        mut self,
        queue: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.queues
            .entry(queue.into())
            .or_default()
            .extend(capabilities);
        self
    }

    /// A `*` grant, when present, replaces every per-queue grant
    pub fn has_permission(&self, queue: &str, capability: Capability) -> bool {
        self.queues
            .get(WILDCARD)
            .or_else(|| self.queues.get(queue))
            .is_some_and(|caps| caps.contains(&capability))
    }
}

/// Authorizer backed by a table of API keys.
///
/// Keys are indexed by their SHA-256 digest so a presented credential is
/// hashed before lookup and raw keys are never kept in memory.
#[derive(Debug, Default)]
pub struct ApiKeyAuthorizer {
    keys: HashMap<String, ApiKeyConfig>,
}

impl ApiKeyAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `{ "<key>": { "description": ..., "queues": {...} } }` document
    pub fn from_json(document: &str) -> Result<Self, AuthError> {
        let mut authorizer = Self::new();
        authorizer.merge_json(document)?;
        Ok(authorizer)
    }

    /// Load keys from an optional file and the `RUSTQUEUE_API_KEYS_JSON`
    /// environment variable. Sources that fail to parse are skipped.
    pub fn load(keys_file: Option<&Path>) -> Self {
        let mut authorizer = Self::new();

        if let Some(path) = keys_file {
            if let Err(e) = authorizer.merge_file(path) {
                warn!(path = %path.display(), error = %e, "Could not load API keys from file");
            }
        }

        if let Ok(document) = std::env::var(API_KEYS_ENV) {
            if let Err(e) = authorizer.merge_json(&document) {
                warn!(error = %e, "Could not parse API keys from environment");
            }
        }

        info!(keys = authorizer.len(), "Loaded API keys");
        authorizer
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<(), AuthError> {
        let document = std::fs::read_to_string(path)?;
        self.merge_json(&document)
    }

    /// Merge keys from a JSON document; later definitions replace earlier ones
    pub fn merge_json(&mut self, document: &str) -> Result<(), AuthError> {
        let parsed: HashMap<String, ApiKeyConfig> = serde_json::from_str(document)?;
        for (key, config) in parsed {
            self.insert(&key, config)?;
        }
        Ok(())
    }

    pub fn insert(&mut self, key: &str, config: ApiKeyConfig) -> Result<(), AuthError> {
        if key.is_empty() {
            return Err(AuthError::EmptyKey);
        }
        self.keys.insert(digest(key), config);
        Ok(())
    }

    pub fn lookup(&self, credential: &str) -> Option<&ApiKeyConfig> {
        if credential.is_empty() {
            return None;
        }
        self.keys.get(&digest(credential))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Authorizer for ApiKeyAuthorizer {
    fn authenticate(&self, credential: &str) -> bool {
        self.lookup(credential).is_some()
    }

    fn authorize(&self, credential: &str, queue: &str, capability: Capability) -> Decision {
        match self.lookup(credential) {
            Some(config) if config.has_permission(queue, capability) => Decision::Allow,
            _ => Decision::Deny,
        }
    }
}

fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEYS: &str = r#"{
        "pk_orders": {
            "description": "Order processing",
            "queues": {
                "orders": ["read", "write", "delete", "manage"],
                "shared_events": ["write"]
            }
        },
        "pk_admin": {
            "description": "Admin",
            "queues": { "*": ["read", "write", "delete", "manage"] }
        }
    }"#;

    #[test]
    fn test_authorize_specific_queue() {
        let auth = ApiKeyAuthorizer::from_json(KEYS).unwrap();

        assert!(auth.authenticate("pk_orders"));
        assert!(auth
            .authorize("pk_orders", "orders", Capability::Delete)
            .is_allowed());
        assert!(auth
            .authorize("pk_orders", "shared_events", Capability::Write)
            .is_allowed());
        assert_eq!(
            auth.authorize("pk_orders", "shared_events", Capability::Read),
            Decision::Deny
        );
        assert_eq!(
            auth.authorize("pk_orders", "payments", Capability::Read),
            Decision::Deny
        );
    }

    #[test]
    fn test_wildcard_grant() {
        let auth = ApiKeyAuthorizer::from_json(KEYS).unwrap();
        assert!(auth
            .authorize("pk_admin", "anything_at_all", Capability::Manage)
            .is_allowed());
    }

    #[test]
    fn test_wildcard_replaces_queue_grants() {
        let config = ApiKeyConfig::new("Mixed")
            .grant("*", [Capability::Read])
            .grant("orders", [Capability::Write]);

        assert!(config.has_permission("orders", Capability::Read));
        assert!(config.has_permission("other", Capability::Read));
        assert!(!config.has_permission("orders", Capability::Write));
    }

    #[test]
    fn test_unknown_key_denied() {
        let auth = ApiKeyAuthorizer::from_json(KEYS).unwrap();

        assert!(!auth.authenticate("pk_nope"));
        assert!(!auth.authenticate(""));
        assert_eq!(
            auth.authorize("pk_nope", "orders", Capability::Read),
            Decision::Deny
        );
    }

    #[test]
    fn test_raw_keys_not_stored() {
        let auth = ApiKeyAuthorizer::from_json(KEYS).unwrap();
        assert!(!auth.keys.contains_key("pk_orders"));
        assert_eq!(auth.len(), 2);
    }

    #[test]
    fn test_builder_grants() {
        let mut auth = ApiKeyAuthorizer::new();
        auth.insert(
            "pk_dev",
            ApiKeyConfig::new("Development").grant("dev_queue", [Capability::Read]),
        )
        .unwrap();

        assert!(auth
            .authorize("pk_dev", "dev_queue", Capability::Read)
            .is_allowed());
        assert!(matches!(
            auth.insert("", ApiKeyConfig::default()),
            Err(AuthError::EmptyKey)
        ));
    }

    #[test]
    fn test_invalid_document() {
        let result = ApiKeyAuthorizer::from_json(r#"{"pk": {"queues": {"q": ["fly"]}}}"#);
        assert!(matches!(result, Err(AuthError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KEYS.as_bytes()).unwrap();

        let auth = ApiKeyAuthorizer::load(Some(file.path()));
        assert!(auth.authenticate("pk_admin"));
    }

    #[test]
    fn test_merge_missing_file_is_io_error() {
        let mut auth = ApiKeyAuthorizer::new();
        let result = auth.merge_file(Path::new("/nonexistent/keys.json"));
        assert!(matches!(result, Err(AuthError::Io(_))));
        assert!(auth.is_empty());
    }

    #[test]
    fn test_load_skips_missing_file() {
        let auth = ApiKeyAuthorizer::load(Some(Path::new("/nonexistent/keys.json")));
        assert!(!auth.authenticate("pk_admin"));
    }
}
