use crate::{
    entities::order::{AddressSnapshot, OrderStatus},
    errors::ServiceError,
    handlers::carts::user_id_from_headers,
    handlers::common::{created_response, success_response, PaginatedResponse, PaginationParams},
    handlers::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    shipping_address: AddressSnapshot,
    #[serde(default)]
    notes: Option<String>,
}

/// Creates an order from the user's cart, then empties the cart.
async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;

    let cart = state.services.carts.get_or_create_cart(user_id).await?;
    let detail = state
        .services
        .orders
        .create_order_from_cart(user_id, &cart, request.shipping_address, request.notes)
        .await?;

    // The order exists at this point; a failed cart clear is an annoyance,
    // not a reason to fail the checkout.
    if let Err(e) = state.services.carts.clear_cart(user_id).await {
        warn!(order_id = %detail.order.id, "Failed to clear cart after checkout: {}", e);
    }

    Ok(created_response(detail))
}

async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    let (orders, total) = state
        .services
        .orders
        .list_orders_for_user(user_id, params.page, params.limit())
        .await?;
    Ok(success_response(PaginatedResponse::new(
        orders,
        params.page,
        params.limit(),
        total,
    )))
}

async fn get_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user_id_from_headers(&headers)?;
    let detail = state
        .services
        .orders
        .get_order_for_user(order_id, user_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    Ok(success_response(detail))
}

#[derive(Debug, Serialize)]
struct AdminOrdersResponse {
    data: crate::services::orders::AdminOrdersPage,
    page: u64,
    per_page: u64,
}

async fn list_all_orders(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let page = state
        .services
        .orders
        .list_all_orders(params.page, params.limit())
        .await?;
    Ok(success_response(AdminOrdersResponse {
        data: page,
        page: params.page,
        per_page: params.limit(),
    }))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: OrderStatus,
    #[serde(default)]
    notes: Option<String>,
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let detail = state
        .services
        .orders
        .update_status(order_id, request.status, request.notes)
        .await?;

    // Customer-facing notices go out in the background; the admin response
    // does not wait on the email provider.
    let notifier = state.services.notifier.clone();
    let notify_detail = detail.clone();
    match request.status {
        OrderStatus::Dispatched => {
            tokio::spawn(async move {
                if let Err(e) = notifier.send_order_dispatched(&notify_detail).await {
                    error!(order_id = %notify_detail.order.id, "Dispatch notice failed: {}", e);
                }
            });
        }
        OrderStatus::Delivered => {
            tokio::spawn(async move {
                if let Err(e) = notifier.send_order_delivered(&notify_detail).await {
                    error!(order_id = %notify_detail.order.id, "Delivery notice failed: {}", e);
                }
            });
        }
        OrderStatus::Cancelled => {
            tokio::spawn(async move {
                if let Err(e) = notifier.send_order_cancelled(&notify_detail).await {
                    error!(order_id = %notify_detail.order.id, "Cancellation notice failed: {}", e);
                }
            });
        }
        _ => {}
    }

    Ok(success_response(detail))
}

/// Manual fulfillment trigger, for orders the webhook path could not finish.
async fn fulfill_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let report = state.services.fulfillment.process_order(order_id).await?;
    Ok(success_response(report))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders", get(list_orders))
        .route("/orders/:order_id", get(get_order))
        .route("/admin/orders", get(list_all_orders))
        .route("/admin/orders/:order_id/status", put(update_order_status))
        .route("/admin/orders/:order_id/fulfill", post(fulfill_order))
}
