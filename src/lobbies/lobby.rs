use axum::{debug_handler, extract::{Path, Query, State}, Json};
use serde::Deserialize;

use crate::{
    db::{GameId, LobbyId, UserId},
    machine::{LeaveOutcome, LobbyInput, LobbyMachine, Paging},
    session::CurrentUser,
    views::LobbyView,
    AppResult,
};

#[derive(Debug, Deserialize)]
pub(crate) struct SearchQuery {
    game_id: Option<GameId>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn search(
    State(machine): State<LobbyMachine>,
    Query(SearchQuery { game_id, page, limit }): Query<SearchQuery>,
) -> AppResult<Json<Vec<LobbyView>>> {
    let lobbies = machine.search_open(game_id, Paging::new(page, limit, 10, 100)).await?;
    Ok(Json(lobbies))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn get_lobby(
    State(machine): State<LobbyMachine>,
    Path(lobby_id): Path<LobbyId>,
) -> AppResult<Json<LobbyView>> {
    Ok(Json(machine.get_lobby(lobby_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn join(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Path(lobby_id): Path<LobbyId>,
) -> AppResult<Json<LobbyView>> {
    Ok(Json(machine.join_lobby(user_id, lobby_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn leave(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
) -> AppResult<Json<LeaveOutcome>> {
    Ok(Json(machine.leave_lobby(user_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn update(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Path(lobby_id): Path<LobbyId>,
    Json(input): Json<LobbyInput>,
) -> AppResult<Json<LobbyView>> {
    Ok(Json(machine.update_lobby(user_id, lobby_id, input).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn kick(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Path((lobby_id, target_id)): Path<(LobbyId, UserId)>,
) -> AppResult<Json<LobbyView>> {
    Ok(Json(machine.kick_member(user_id, lobby_id, target_id).await?))
}
