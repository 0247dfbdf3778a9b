//! Stored provider credentials and the resolver nodes use at run time.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use nodes::{Credential, CredentialError, CredentialReference, CredentialResolver, ResolvedCredential};

use crate::models::CredentialRow;
use crate::DbError;

const CREDENTIAL_COLUMNS: &str = "id, owner, provider, label, account_identifier, encrypted_token, \
     token_expires_at, scopes, last_used_at, created_at";

/// Credentials connected by `owner`, for validation.
pub async fn list_credentials(pool: &PgPool, owner: Uuid) -> Result<Vec<Credential>, DbError> {
    let rows = sqlx::query_as::<_, CredentialRow>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM workflow_credentials WHERE owner = $1 ORDER BY created_at"
    ))
    .bind(owner)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Credential::from).collect())
}

/// Resolves references against one owner's stored credentials.
///
/// The stored token is handed out as the secret unchanged; decrypting it is
/// the job of whatever wraps this resolver.
#[derive(Debug, Clone)]
pub struct PgCredentialResolver {
    pool: PgPool,
    owner: Uuid,
}

impl PgCredentialResolver {
    pub fn new(pool: PgPool, owner: Uuid) -> Self {
        Self { pool, owner }
    }
}

fn backend(err: sqlx::Error) -> CredentialError {
    CredentialError::Backend(err.to_string())
}

#[async_trait]
impl CredentialResolver for PgCredentialResolver {
    async fn resolve(&self, reference: &CredentialReference) -> Result<ResolvedCredential, CredentialError> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM workflow_credentials \
             WHERE owner = $1 AND provider = $2 AND ($3::text IS NULL OR account_identifier = $3) \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(self.owner)
        .bind(&reference.provider)
        .bind(&reference.account)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| CredentialError::NotFound {
            provider: reference.provider.clone(),
        })?;

        let credential = Credential::from(row);
        let now = Utc::now();
        if credential.is_expired(now) {
            return Err(CredentialError::Expired {
                provider: reference.provider.clone(),
            });
        }

        sqlx::query("UPDATE workflow_credentials SET last_used_at = $2 WHERE id = $1")
            .bind(credential.id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        debug!(provider = %credential.provider, account = %credential.account_identifier, "credential resolved");
        Ok(ResolvedCredential {
            provider: credential.provider,
            account_identifier: credential.account_identifier,
            secret: credential.encrypted_token,
            expires_at: credential.token_expires_at,
            scopes: credential.scopes,
        })
    }
}
