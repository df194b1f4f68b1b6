use axum::{debug_handler, extract::{Path, Query, State}, http::StatusCode, Json};
use serde::Deserialize;

use crate::{
    db::LobbyId,
    machine::{LobbyMachine, Paging},
    session::CurrentUser,
    views::MessageView,
    AppResult,
};

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn post_message(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Path(lobby_id): Path<LobbyId>,
    Json(SendMessageRequest { content }): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<MessageView>)> {
    let message = machine.post_message(user_id, lobby_id, &content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list_messages(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Path(lobby_id): Path<LobbyId>,
    Query(HistoryQuery { page, limit }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<MessageView>>> {
    let messages = machine.messages(user_id, lobby_id, Paging::new(page, limit, 50, 200)).await?;
    Ok(Json(messages))
}
