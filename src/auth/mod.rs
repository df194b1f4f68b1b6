//! Session bootstrap. Real credential checks belong to the identity provider
//! in front of this service; here a nickname is bound to the session.

use sqlx::SqlitePool;

use crate::{
    appresult::{AppError, AppResult},
    db::User,
    store,
};

mod login;
mod logout;

pub use login::login;
pub use logout::logout;

pub const MAX_NICKNAME_LEN: usize = 32;

/// Finds the user with `nickname`, creating it on first sight.
pub async fn find_or_create_user(db_pool: &SqlitePool, nickname: &str) -> AppResult<User> {
    let nickname = nickname.trim();
    if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_LEN {
        return Err(AppError::validation(format!(
            "nickname must be 1 to {MAX_NICKNAME_LEN} characters"
        )));
    }

    let mut conn = db_pool.acquire().await?;
    if let Some(user) = store::user_by_nickname(&mut conn, nickname).await? {
        return Ok(user);
    }

    match store::insert_user(&mut conn, nickname).await {
        Ok(user) => {
            tracing::info!(user_id = %user.id, nickname, "user created");
            Ok(user)
        }
        // lost a race with another login for the same nickname
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => store::user_by_nickname(&mut conn, nickname)
            .await?
            .ok_or_else(|| AppError::not_found("user not found")),
        Err(err) => Err(err.into()),
    }
}
