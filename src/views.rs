//! Serialized shapes returned by the HTTP surface and carried in events.
//! All of them are built from what is persisted, never from request input.

use serde::Serialize;
use sqlx::SqliteConnection;
use time::OffsetDateTime;

use crate::{
    db::{self, GameId, LobbyId, MessageId, MessageKind, UserId},
    store,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicUser {
    pub id: UserId,
    pub nickname: String,
}

impl From<&db::User> for PublicUser {
    fn from(user: &db::User) -> Self {
        Self {
            id: user.id,
            nickname: user.nickname.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameView {
    pub id: GameId,
    pub name: String,
    pub description: String,
    pub steam_url: Option<String>,
}

impl From<db::Game> for GameView {
    fn from(game: db::Game) -> Self {
        Self {
            id: game.id,
            name: game.name,
            description: game.description,
            steam_url: game.steam_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbyView {
    pub id: LobbyId,
    pub description: String,
    pub max_players: i64,
    pub member_count: i64,
    /// Derived on every read by comparing members to capacity.
    pub is_open: bool,
    pub game: GameView,
    pub host: PublicUser,
    /// In join order.
    pub members: Vec<PublicUser>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: MessageId,
    pub lobby_id: LobbyId,
    pub user_id: Option<UserId>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<PublicUser>,
}

impl MessageView {
    pub fn new(message: db::Message, author: Option<PublicUser>) -> Self {
        Self {
            id: message.id,
            lobby_id: message.lobby_id,
            user_id: message.user_id,
            kind: message.kind,
            content: message.content,
            created_at: message.created_at,
            user: author,
        }
    }
}

pub async fn lobby_view(conn: &mut SqliteConnection, lobby_id: LobbyId) -> sqlx::Result<Option<LobbyView>> {
    let Some(lobby) = store::lobby(&mut *conn, lobby_id).await? else {
        return Ok(None);
    };
    lobby_view_of(conn, lobby).await.map(Some)
}

pub async fn lobby_view_of(conn: &mut SqliteConnection, lobby: db::Lobby) -> sqlx::Result<LobbyView> {
    let game = store::game(&mut *conn, lobby.game_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    let members = store::members(&mut *conn, lobby.id).await?;
    let host = match members.iter().find(|member| member.id == lobby.host_id) {
        Some(host) => PublicUser::from(host),
        None => store::user(&mut *conn, lobby.host_id)
            .await?
            .as_ref()
            .map(PublicUser::from)
            .ok_or(sqlx::Error::RowNotFound)?,
    };
    let member_count = members.len() as i64;

    Ok(LobbyView {
        id: lobby.id,
        description: lobby.description,
        max_players: lobby.max_players,
        member_count,
        is_open: member_count < lobby.max_players,
        game: game.into(),
        host,
        members: members.iter().map(PublicUser::from).collect(),
        created_at: lobby.created_at,
    })
}

pub async fn message_view(conn: &mut SqliteConnection, message: db::Message) -> sqlx::Result<MessageView> {
    let author = match message.user_id {
        Some(user_id) => store::user(conn, user_id).await?.as_ref().map(PublicUser::from),
        None => None,
    };
    Ok(MessageView::new(message, author))
}
