mod events;
mod lobby;
mod msg;
mod new;

use axum::{routing::{delete, get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(lobby::search).post(new::create_lobby))
        .route("/leave", post(lobby::leave))
        .route("/{id}", get(lobby::get_lobby).put(lobby::update))
        .route("/{id}/join", post(lobby::join))
        .route("/{id}/members/{user_id}", delete(lobby::kick))
        .route("/{id}/events", get(events::lobby_events))
        .route("/{id}/messages", get(msg::list_messages).post(msg::post_message))
}
