use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::{session::USER_ID, views::PublicUser, AppResult};

use super::find_or_create_user;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub nickname: String,
}

#[debug_handler(state = crate::AppState)]
pub async fn login(
    State(db_pool): State<SqlitePool>,
    session: Session,
    Json(LoginRequest { nickname }): Json<LoginRequest>,
) -> AppResult<Json<PublicUser>> {
    let user = find_or_create_user(&db_pool, &nickname).await?;

    session.cycle_id().await?;
    session.insert(USER_ID, user.id).await?;
    tracing::debug!(user_id = %user.id, "session bound");

    Ok(Json(PublicUser::from(&user)))
}
