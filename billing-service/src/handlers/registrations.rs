//! Webhook registration management handlers.
//!
//! The shared secret is returned in plaintext exactly once, on creation or
//! rotation; the stored model never serializes it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::ActorContext;
use crate::models::{
    CreateWebhookRegistration, RegistrationStatus, UpdateWebhookRegistration, WebhookRegistration,
};
use crate::services::reconcile;
use crate::startup::AppState;

const GENERATED_SECRET_LEN: usize = 40;

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Serialize)]
pub struct RegistrationWithSecret {
    #[serde(flatten)]
    pub registration: WebhookRegistration,
    /// Plaintext secret, shown only in this response.
    pub secret: String,
}

pub async fn create_registration(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(input): Json<CreateWebhookRegistration>,
) -> Result<(StatusCode, Json<RegistrationWithSecret>), AppError> {
    let provider = input.provider.trim().to_lowercase();
    let event = input.event.trim().to_lowercase();
    if provider.is_empty() || event.is_empty() {
        return Err(AppError::ValidationError(
            "provider and event must not be empty".to_string(),
        ));
    }

    let secret = input
        .secret
        .filter(|s| !s.is_empty())
        .unwrap_or_else(generate_secret);
    let retry_window = reconcile::clamp_retry_window(input.retry_window_minutes);

    let registration = state
        .db
        .create_registration(&actor.actor, &provider, &event, &secret, retry_window)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegistrationWithSecret {
            registration,
            secret,
        }),
    ))
}

pub async fn list_registrations(
    State(state): State<AppState>,
) -> Result<Json<Vec<WebhookRegistration>>, AppError> {
    let registrations = state.db.list_registrations().await?;
    Ok(Json(registrations))
}

pub async fn get_registration(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
) -> Result<Json<WebhookRegistration>, AppError> {
    let registration = state
        .db
        .get_registration(registration_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Webhook registration {} not found",
                registration_id
            ))
        })?;
    Ok(Json(registration))
}

pub async fn update_registration(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(registration_id): Path<Uuid>,
    Json(mut input): Json<UpdateWebhookRegistration>,
) -> Result<Json<WebhookRegistration>, AppError> {
    if let Some(status) = &input.status {
        if status != "active" && status != "inactive" {
            return Err(AppError::ValidationError(format!(
                "unknown registration status '{}'",
                status
            )));
        }
    }
    if let Some(window) = input.retry_window_minutes {
        input.retry_window_minutes = Some(reconcile::clamp_retry_window(Some(window)));
    }

    let registration = state
        .db
        .update_registration(&actor.actor, registration_id, &input)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Webhook registration {} not found",
                registration_id
            ))
        })?;

    Ok(Json(registration))
}

/// Flip a registration between active and inactive.
pub async fn toggle_registration(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(registration_id): Path<Uuid>,
) -> Result<Json<WebhookRegistration>, AppError> {
    let current = state
        .db
        .get_registration(registration_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Webhook registration {} not found",
                registration_id
            ))
        })?;

    let next = if current.status == RegistrationStatus::Active.as_str() {
        RegistrationStatus::Inactive
    } else {
        RegistrationStatus::Active
    };

    let registration = state
        .db
        .update_registration(
            &actor.actor,
            registration_id,
            &UpdateWebhookRegistration {
                status: Some(next.as_str().to_string()),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Webhook registration {} not found",
                registration_id
            ))
        })?;

    Ok(Json(registration))
}

pub async fn rotate_secret(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(registration_id): Path<Uuid>,
) -> Result<Json<RegistrationWithSecret>, AppError> {
    let secret = generate_secret();
    let registration = state
        .db
        .update_registration(
            &actor.actor,
            registration_id,
            &UpdateWebhookRegistration {
                secret: Some(secret.clone()),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Webhook registration {} not found",
                registration_id
            ))
        })?;

    Ok(Json(RegistrationWithSecret {
        registration,
        secret,
    }))
}
