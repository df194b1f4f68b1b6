use axum::{debug_handler, extract::State, http::StatusCode, Json};

use crate::{
    machine::{LobbyInput, LobbyMachine},
    session::CurrentUser,
    views::LobbyView,
    AppResult,
};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn create_lobby(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Json(input): Json<LobbyInput>,
) -> AppResult<(StatusCode, Json<LobbyView>)> {
    let lobby = machine.create_lobby(user_id, input).await?;
    Ok((StatusCode::CREATED, Json(lobby)))
}
