use crate::catalog::CatalogStore;
use crate::error::EtlError;

/// Upstream credential row. Read-only from the engine's point of view.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Credential {
    pub id: i64,
    pub base_url: String,
    pub api_key: String,
    pub is_active: bool,
}

impl CatalogStore {
    /// Look up an active credential by id. Inactive and missing rows both
    /// come back as `None`; the executor falls back to the process default.
    pub async fn credential(&self, credential_id: i64) -> Result<Option<Credential>, EtlError> {
        Ok(sqlx::query_as::<_, Credential>(
            "SELECT id, base_url, api_key, is_active \
             FROM api_credentials WHERE id = $1 AND is_active",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
