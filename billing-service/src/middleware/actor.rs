//! Actor context extraction.
//!
//! Operator-facing endpoints require an explicit actor so every audited
//! mutation names who caused it. The header is set by the storefront or the
//! back-office gateway after authentication; webhook ingestion synthesizes
//! a `provider:<name>` actor instead of using this extractor.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const ACTOR_HEADER: &str = "X-Actor";
pub const ACTOR_ROLE_HEADER: &str = "X-Actor-Role";

/// Who is performing the request, as recorded in the audit trail.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor: String,
    pub role: Option<String>,
}

impl ActorContext {
    pub fn new(actor: String, role: Option<String>) -> Self {
        Self { actor, role }
    }

    /// Elevated actors may record into locked periods.
    pub fn is_elevated(&self) -> bool {
        matches!(self.role.as_deref(), Some("admin"))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing X-Actor header")))?;

        let role = parts
            .headers
            .get(ACTOR_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_lowercase())
            .filter(|v| !v.is_empty());

        let span = tracing::Span::current();
        span.record("actor", actor);

        Ok(ActorContext::new(actor.to_string(), role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_is_elevated() {
        let context = ActorContext::new("asha".to_string(), Some("admin".to_string()));
        assert!(context.is_elevated());
    }

    #[test]
    fn cashier_and_missing_roles_are_not_elevated() {
        assert!(!ActorContext::new("ravi".to_string(), Some("cashier".to_string())).is_elevated());
        assert!(!ActorContext::new("ravi".to_string(), None).is_elevated());
    }
}
