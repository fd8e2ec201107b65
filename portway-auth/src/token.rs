use chrono::{DateTime, Utc};

/// A persisted token grant. Created by the out-of-band provisioning tool,
/// verified on every request, never mutated during one.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRecord {
    pub id: i64,
    pub username: String,
    pub token_hash: String,
    pub token_salt: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// CSV of endpoint scope patterns (`*`, exact, trailing-star).
    pub allowed_scopes: String,
    /// CSV of environment patterns.
    pub allowed_environments: String,
    pub description: String,
}

impl TokenRecord {
    /// Active means not revoked and not past expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> TokenRecord {
        TokenRecord {
            id: 1,
            username: "svc-orders".into(),
            token_hash: String::new(),
            token_salt: String::new(),
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
            allowed_scopes: "*".into(),
            allowed_environments: "*".into(),
            description: String::new(),
        }
    }

    #[test]
    fn test_active_without_expiry() {
        assert!(record().is_active(Utc::now()));
    }

    #[test]
    fn test_expired_is_inactive() {
        let mut r = record();
        r.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(!r.is_active(Utc::now()));
    }

    #[test]
    fn test_future_expiry_is_active() {
        let mut r = record();
        r.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(r.is_active(Utc::now()));
    }

    #[test]
    fn test_revoked_is_inactive() {
        let mut r = record();
        r.revoked_at = Some(Utc::now());
        assert!(!r.is_active(Utc::now()));
    }
}
