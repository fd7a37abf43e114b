use crate::{
    errors::ServiceError,
    handlers::common::{no_content_response, success_response, validate_input},
    handlers::AppState,
    services::carts::CartItemInput,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Pulls the acting user out of the `X-User-Id` header. The storefront
/// frontend terminates authentication and forwards the user id.
pub(crate) fn user_id_from_headers(headers: &HeaderMap) -> Result<Uuid, ServiceError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("Missing X-User-Id header".to_string()))?;
    Uuid::parse_str(raw)
        .map_err(|_| ServiceError::Unauthorized("Invalid X-User-Id header".to_string()))
}

async fn get_cart(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    let detail = state.services.carts.get_or_create_cart(user_id).await?;
    Ok(success_response(detail))
}

async fn add_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CartItemInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    let detail = state.services.carts.add_item(user_id, input).await?;
    Ok(success_response(detail))
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateQuantityRequest {
    #[validate(length(min = 1))]
    seller: String,
    #[validate(range(min = 1))]
    quantity: i32,
}

async fn update_item_quantity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    validate_input(&request)?;
    let detail = state
        .services
        .carts
        .update_item_quantity(user_id, item_id, &request.seller, request.quantity)
        .await?;
    Ok(success_response(detail))
}

#[derive(Debug, Deserialize)]
struct RemoveItemParams {
    seller: Option<String>,
}

async fn remove_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<Uuid>,
    Query(params): Query<RemoveItemParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    let detail = state
        .services
        .carts
        .remove_item(user_id, item_id, params.seller.as_deref())
        .await?;
    Ok(success_response(detail))
}

async fn clear_cart(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    state.services.carts.clear_cart(user_id).await?;
    Ok(no_content_response())
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart))
        .route("/cart", delete(clear_cart))
        .route("/cart/items", post(add_item))
        .route("/cart/items/:item_id", put(update_item_quantity))
        .route("/cart/items/:item_id", delete(remove_item))
}
