//! Gateway protocol endpoint

use axum::{routing::get, Router};

use crate::gateway::gateway_ws_handler;
use crate::state::Gateway;

pub fn router() -> Router<Gateway> {
    Router::new().route("/ws", get(gateway_ws_handler))
}
