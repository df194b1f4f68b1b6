use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use time::OffsetDateTime;
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(UserId);
id_type!(LobbyId);
id_type!(GameId);
id_type!(MessageId);

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub nickname: String,
    pub current_lobby_id: Option<LobbyId>,
    pub joined_lobby_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Game {
    pub id: GameId,
    pub name: String,
    pub description: String,
    pub steam_url: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Lobby {
    pub id: LobbyId,
    pub game_id: GameId,
    pub host_id: UserId,
    pub description: String,
    pub max_players: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
}

/// A chat row. `user_id` is absent for system messages.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub lobby_id: LobbyId,
    pub user_id: Option<UserId>,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: OffsetDateTime,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    id          BLOB PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    steam_url   TEXT UNIQUE
);

CREATE TABLE IF NOT EXISTS users (
    id               BLOB PRIMARY KEY NOT NULL,
    nickname         TEXT NOT NULL UNIQUE,
    current_lobby_id BLOB REFERENCES lobbies(id),
    joined_lobby_at  TEXT
);
CREATE INDEX IF NOT EXISTS users_current_lobby ON users(current_lobby_id);

CREATE TABLE IF NOT EXISTS lobbies (
    id          BLOB PRIMARY KEY NOT NULL,
    game_id     BLOB NOT NULL REFERENCES games(id),
    host_id     BLOB NOT NULL REFERENCES users(id),
    description TEXT NOT NULL DEFAULT '',
    max_players INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id         BLOB PRIMARY KEY NOT NULL,
    lobby_id   BLOB NOT NULL REFERENCES lobbies(id) ON DELETE CASCADE,
    user_id    BLOB REFERENCES users(id),
    kind       TEXT NOT NULL DEFAULT 'text',
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_lobby ON messages(lobby_id, created_at);
"#;

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let db_pool = if database_url.contains(":memory:") {
        // every connection to an in-memory database is its own database
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options.journal_mode(SqliteJournalMode::Wal))
            .await?
    };

    migrate(&db_pool).await?;
    Ok(db_pool)
}

/// Opens a transaction holding SQLite's write lock from its first statement.
/// Concurrent writers queue on the busy timeout instead of failing when a
/// deferred read lock cannot be upgraded.
pub async fn begin_write(db_pool: &SqlitePool) -> sqlx::Result<Transaction<'static, Sqlite>> {
    db_pool.begin_with("BEGIN IMMEDIATE").await
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(db_pool).await?;
    tracing::debug!("schema ready");
    Ok(())
}
