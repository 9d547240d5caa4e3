//! Item catalogue handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use service_core::error::AppError;

use crate::middleware::ActorContext;
use crate::models::{CreateItem, Item};
use crate::startup::AppState;

pub async fn create_item(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(input): Json<CreateItem>,
) -> Result<(StatusCode, Json<Item>), AppError> {
    if input.name.trim().is_empty() {
        return Err(AppError::ValidationError(
            "item name must not be empty".to_string(),
        ));
    }

    let item = state.db.create_item(&actor.actor, &input).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn list_items(State(state): State<AppState>) -> Result<Json<Vec<Item>>, AppError> {
    let items = state.db.list_items().await?;
    Ok(Json(items))
}
