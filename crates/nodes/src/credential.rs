//! Credentials as seen by node executors.
//!
//! Executors never read credential storage directly; they hold a
//! [`CredentialReference`] (provider + optional account) and ask a
//! [`CredentialResolver`] for a usable secret.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::CredentialError;

/// A stored connection to an external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub owner: Uuid,
    pub provider: String,
    pub account_identifier: String,
    /// Opaque at this layer; decryption belongs to the secret backend.
    pub encrypted_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.is_some_and(|at| at < now)
    }

    pub fn matches(&self, reference: &CredentialReference) -> bool {
        self.provider == reference.provider
            && reference
                .account
                .as_deref()
                .map_or(true, |account| account == self.account_identifier)
    }
}

/// What a node asks for: "a google credential", optionally a specific account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialReference {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl CredentialReference {
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account: None,
        }
    }

    /// Read an explicit reference from a node's `credential` config field.
    ///
    /// Accepts `"google"` or `{"provider": "google", "account": "me@x.com"}`.
    pub fn from_config(config: &Value) -> Option<Self> {
        match config.get("credential")? {
            Value::String(provider) if !provider.is_empty() => Some(Self::provider(provider.clone())),
            other @ Value::Object(_) => serde_json::from_value(other.clone()).ok(),
            _ => None,
        }
    }
}

/// A secret ready to be attached to an outbound request.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub provider: String,
    pub account_identifier: String,
    pub secret: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("provider", &self.provider)
            .field("account_identifier", &self.account_identifier)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Capability: turn a reference into a usable secret.
///
/// Implementations may perform a token refresh, so callers treat this as a
/// blocking external call with its own timeout.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &CredentialReference) -> Result<ResolvedCredential, CredentialError>;
}

/// Resolver over an in-process credential list with plaintext secrets.
///
/// Used by the CLI and tests; production deployments plug in a resolver
/// backed by their secret store.
#[derive(Default)]
pub struct MemoryCredentialResolver {
    entries: Mutex<Vec<(Credential, String)>>,
}

impl MemoryCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: Credential, secret: impl Into<String>) {
        self.entries().push((credential, secret.into()));
    }

    /// Snapshot of the stored credential records (secrets excluded).
    pub fn credentials(&self) -> Vec<Credential> {
        self.entries().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Lock the entries, recovering them from a poisoned mutex.
    fn entries(&self) -> MutexGuard<'_, Vec<(Credential, String)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialResolver for MemoryCredentialResolver {
    async fn resolve(&self, reference: &CredentialReference) -> Result<ResolvedCredential, CredentialError> {
        let now = Utc::now();
        let mut entries = self.entries();

        let (credential, secret) = entries
            .iter_mut()
            .find(|(c, _)| c.matches(reference))
            .ok_or_else(|| CredentialError::NotFound {
                provider: reference.provider.clone(),
            })?;

        if credential.is_expired(now) {
            return Err(CredentialError::Expired {
                provider: reference.provider.clone(),
            });
        }

        credential.last_used_at = Some(now);

        Ok(ResolvedCredential {
            provider: credential.provider.clone(),
            account_identifier: credential.account_identifier.clone(),
            secret: secret.clone(),
            expires_at: credential.token_expires_at,
            scopes: credential.scopes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn credential(provider: &str, account: &str, expires_in: Option<Duration>) -> Credential {
        Credential {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            provider: provider.into(),
            account_identifier: account.into(),
            encrypted_token: "ciphertext".into(),
            token_expires_at: expires_in.map(|d| Utc::now() + d),
            scopes: vec![],
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reference_parses_from_string_or_object() {
        assert_eq!(
            CredentialReference::from_config(&json!({ "credential": "slack" })),
            Some(CredentialReference::provider("slack"))
        );
        let explicit =
            CredentialReference::from_config(&json!({ "credential": { "provider": "google", "account": "a@b.c" } }))
                .unwrap();
        assert_eq!(explicit.account.as_deref(), Some("a@b.c"));
        assert_eq!(CredentialReference::from_config(&json!({})), None);
    }

    #[tokio::test]
    async fn resolves_matching_account_and_stamps_usage() {
        let resolver = MemoryCredentialResolver::new();
        resolver.insert(credential("google", "work@x.com", None), "tok-work");
        resolver.insert(credential("google", "home@x.com", None), "tok-home");

        let reference = CredentialReference {
            provider: "google".into(),
            account: Some("home@x.com".into()),
        };
        let resolved = resolver.resolve(&reference).await.unwrap();
        assert_eq!(resolved.secret, "tok-home");

        let used: Vec<_> = resolver
            .credentials()
            .into_iter()
            .filter(|c| c.last_used_at.is_some())
            .collect();
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].account_identifier, "home@x.com");
    }

    #[tokio::test]
    async fn expired_and_missing_credentials_are_rejected() {
        let resolver = MemoryCredentialResolver::new();
        resolver.insert(credential("slack", "team", Some(Duration::hours(-1))), "old");

        assert!(matches!(
            resolver.resolve(&CredentialReference::provider("slack")).await,
            Err(CredentialError::Expired { .. })
        ));
        assert!(matches!(
            resolver.resolve(&CredentialReference::provider("github")).await,
            Err(CredentialError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn insert_survives_a_poisoned_lock() {
        let resolver = std::sync::Arc::new(MemoryCredentialResolver::new());
        let holder = std::sync::Arc::clone(&resolver);
        let panicked = std::thread::spawn(move || {
            let _guard = holder.entries.lock().unwrap();
            panic!("writer died");
        })
        .join();
        assert!(panicked.is_err());
        assert!(resolver.entries.is_poisoned());

        resolver.insert(credential("slack", "team", None), "tok");
        assert_eq!(resolver.credentials().len(), 1);
        let resolved = resolver.resolve(&CredentialReference::provider("slack")).await.unwrap();
        assert_eq!(resolved.secret, "tok");
    }
}
