use axum::{routing::post, Router};

use crate::{billing, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/webhooks/payments", post(webhooks::payment_webhook))
        .merge(billing::routes())
}
