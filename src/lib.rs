pub mod appresult;
pub mod auth;
pub mod config;
pub mod db;
pub mod hub;
pub mod lobbies;
pub mod machine;
pub mod notify;
pub mod session;
pub mod store;
pub mod views;

use axum::{
    debug_handler,
    extract::FromRef,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;

use hub::Hub;
use machine::LobbyMachine;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub machine: LobbyMachine,
}

impl AppState {
    /// Wires the process's one hub into the state machine.
    pub fn new(db_pool: SqlitePool, hub: Hub) -> Self {
        let machine = LobbyMachine::new(db_pool.clone(), hub);
        Self { db_pool, machine }
    }
}

/// Every route, without the session layer, which the caller supplies.
pub fn router(app_state: AppState) -> Router {
    let api = Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .nest("/lobbies", lobbies::router());

    Router::new()
        .route("/ping", get(ping))
        .nest("/api/v1", api)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[debug_handler]
async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}
