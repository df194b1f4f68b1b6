//! Persistence accessors.
//!
//! Every function runs against a caller-supplied connection so the state
//! machine decides what shares a transaction. Nothing here loads an
//! association behind the caller's back.

use sqlx::SqliteConnection;
use time::OffsetDateTime;

use crate::db::{Game, GameId, Lobby, LobbyId, Message, MessageId, MessageKind, User, UserId};

pub async fn user(conn: &mut SqliteConnection, user_id: UserId) -> sqlx::Result<Option<User>> {
    sqlx::query_as("SELECT id,nickname,current_lobby_id,joined_lobby_at FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(conn)
        .await
}

pub async fn user_by_nickname(conn: &mut SqliteConnection, nickname: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as("SELECT id,nickname,current_lobby_id,joined_lobby_at FROM users WHERE nickname=?")
        .bind(nickname)
        .fetch_optional(conn)
        .await
}

pub async fn insert_user(conn: &mut SqliteConnection, nickname: &str) -> sqlx::Result<User> {
    let user = User {
        id: UserId::new(),
        nickname: nickname.to_owned(),
        current_lobby_id: None,
        joined_lobby_at: None,
    };
    sqlx::query("INSERT INTO users (id,nickname) VALUES (?,?)")
        .bind(user.id)
        .bind(&user.nickname)
        .execute(conn)
        .await?;
    Ok(user)
}

/// The lobby `user_id` currently belongs to, if the user exists and is in one.
pub async fn current_lobby(conn: &mut SqliteConnection, user_id: UserId) -> sqlx::Result<Option<LobbyId>> {
    let row: Option<(Option<LobbyId>,)> = sqlx::query_as("SELECT current_lobby_id FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.and_then(|(lobby_id,)| lobby_id))
}

pub async fn game(conn: &mut SqliteConnection, game_id: GameId) -> sqlx::Result<Option<Game>> {
    sqlx::query_as("SELECT id,name,description,steam_url FROM games WHERE id=?")
        .bind(game_id)
        .fetch_optional(conn)
        .await
}

/// Catalog management lives elsewhere; this exists for seeding.
pub async fn insert_game(
    conn: &mut SqliteConnection,
    name: &str,
    description: &str,
    steam_url: Option<&str>,
) -> sqlx::Result<Game> {
    let game = Game {
        id: GameId::new(),
        name: name.to_owned(),
        description: description.to_owned(),
        steam_url: steam_url.map(str::to_owned),
    };
    sqlx::query("INSERT INTO games (id,name,description,steam_url) VALUES (?,?,?,?)")
        .bind(game.id)
        .bind(&game.name)
        .bind(&game.description)
        .bind(&game.steam_url)
        .execute(conn)
        .await?;
    Ok(game)
}

pub async fn lobby(conn: &mut SqliteConnection, lobby_id: LobbyId) -> sqlx::Result<Option<Lobby>> {
    sqlx::query_as("SELECT id,game_id,host_id,description,max_players,created_at FROM lobbies WHERE id=?")
        .bind(lobby_id)
        .fetch_optional(conn)
        .await
}

pub async fn insert_lobby(conn: &mut SqliteConnection, lobby: &Lobby) -> sqlx::Result<()> {
    sqlx::query("INSERT INTO lobbies (id,game_id,host_id,description,max_players,created_at) VALUES (?,?,?,?,?,?)")
        .bind(lobby.id)
        .bind(lobby.game_id)
        .bind(lobby.host_id)
        .bind(&lobby.description)
        .bind(lobby.max_players)
        .bind(lobby.created_at)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn update_lobby(
    conn: &mut SqliteConnection,
    lobby_id: LobbyId,
    game_id: GameId,
    description: &str,
    max_players: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE lobbies SET game_id=?,description=?,max_players=? WHERE id=?")
        .bind(game_id)
        .bind(description)
        .bind(max_players)
        .bind(lobby_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn set_host(conn: &mut SqliteConnection, lobby_id: LobbyId, host_id: UserId) -> sqlx::Result<()> {
    sqlx::query("UPDATE lobbies SET host_id=? WHERE id=?")
        .bind(host_id)
        .bind(lobby_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn delete_lobby(conn: &mut SqliteConnection, lobby_id: LobbyId) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM lobbies WHERE id=?")
        .bind(lobby_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Members in join order, earliest first.
pub async fn members(conn: &mut SqliteConnection, lobby_id: LobbyId) -> sqlx::Result<Vec<User>> {
    sqlx::query_as(
        "SELECT id,nickname,current_lobby_id,joined_lobby_at FROM users
         WHERE current_lobby_id=? ORDER BY joined_lobby_at, rowid",
    )
    .bind(lobby_id)
    .fetch_all(conn)
    .await
}

pub async fn member_count(conn: &mut SqliteConnection, lobby_id: LobbyId) -> sqlx::Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE current_lobby_id=?")
        .bind(lobby_id)
        .fetch_one(conn)
        .await?;
    Ok(count)
}

/// Moves a lobby-less user into `lobby_id`, re-checking capacity inside the
/// same statement. Returns false when the user already has a lobby or the
/// lobby has no free seat.
pub async fn claim_seat(
    conn: &mut SqliteConnection,
    user_id: UserId,
    lobby_id: LobbyId,
    joined_at: OffsetDateTime,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE users SET current_lobby_id=?1, joined_lobby_at=?2
         WHERE id=?3 AND current_lobby_id IS NULL
           AND (SELECT COUNT(*) FROM users WHERE current_lobby_id=?1)
             < (SELECT max_players FROM lobbies WHERE id=?1)",
    )
    .bind(lobby_id)
    .bind(joined_at)
    .bind(user_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Clears `user_id`'s membership if it still points at `lobby_id`.
pub async fn release_seat(conn: &mut SqliteConnection, user_id: UserId, lobby_id: LobbyId) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE users SET current_lobby_id=NULL, joined_lobby_at=NULL WHERE id=? AND current_lobby_id=?",
    )
    .bind(user_id)
    .bind(lobby_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Lobbies with at least one free seat, oldest first.
pub async fn open_lobbies(
    conn: &mut SqliteConnection,
    game_id: Option<GameId>,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<Lobby>> {
    sqlx::query_as(
        "SELECT l.id,l.game_id,l.host_id,l.description,l.max_players,l.created_at
         FROM lobbies l LEFT JOIN users u ON u.current_lobby_id = l.id
         WHERE (?1 IS NULL OR l.game_id = ?1)
         GROUP BY l.id
         HAVING COUNT(u.id) < l.max_players
         ORDER BY l.created_at, l.rowid
         LIMIT ?2 OFFSET ?3",
    )
    .bind(game_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
}

pub async fn insert_message(
    conn: &mut SqliteConnection,
    lobby_id: LobbyId,
    user_id: Option<UserId>,
    kind: MessageKind,
    content: &str,
) -> sqlx::Result<Message> {
    let message = Message {
        id: MessageId::new(),
        lobby_id,
        user_id,
        kind,
        content: content.to_owned(),
        created_at: OffsetDateTime::now_utc(),
    };
    sqlx::query("INSERT INTO messages (id,lobby_id,user_id,kind,content,created_at) VALUES (?,?,?,?,?,?)")
        .bind(message.id)
        .bind(message.lobby_id)
        .bind(message.user_id)
        .bind(message.kind)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(conn)
        .await?;
    Ok(message)
}

/// One page of history counted back from the newest message, returned
/// oldest first.
pub async fn messages(
    conn: &mut SqliteConnection,
    lobby_id: LobbyId,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<Message>> {
    let mut messages: Vec<Message> = sqlx::query_as(
        "SELECT id,lobby_id,user_id,kind,content,created_at FROM messages
         WHERE lobby_id=? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
    )
    .bind(lobby_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await?;
    messages.reverse();
    Ok(messages)
}
