use axum::{extract::FromRequestParts, http::request::Parts};
use tower_sessions::Session;

use crate::{appresult::AppError, db::UserId};

pub const USER_ID: &str = "user_id";

/// The authenticated caller, read from the session.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| AppError::Unauthorized(msg.to_owned()))?;

        match session.get::<UserId>(USER_ID).await? {
            Some(user_id) => Ok(CurrentUser(user_id)),
            None => Err(AppError::Unauthorized("not logged in".to_owned())),
        }
    }
}
