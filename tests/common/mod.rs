#![allow(dead_code)]

use std::time::Duration;

use playmatch::{
    auth,
    db::{self, GameId, LobbyId, UserId},
    hub::{Hub, Subscription},
    machine::{LobbyInput, LobbyMachine},
    store,
};
use serde_json::Value;
use sqlx::SqlitePool;
use tempfile::TempDir;

pub struct Fixture {
    pub db_pool: SqlitePool,
    pub hub: Hub,
    pub machine: LobbyMachine,
    pub game: GameId,
    _dir: Option<TempDir>,
}

/// In-memory database behind a single connection.
pub async fn fixture() -> Fixture {
    let db_pool = db::connect("sqlite::memory:", 1).await.unwrap();
    build(db_pool, None).await
}

/// WAL database file with a pool of `connections`, so transactions on
/// different connections really overlap.
pub async fn file_fixture(connections: u32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("playmatch.db").display());
    let db_pool = db::connect(&url, connections).await.unwrap();
    build(db_pool, Some(dir)).await
}

async fn build(db_pool: SqlitePool, dir: Option<TempDir>) -> Fixture {
    let hub = Hub::new(32);
    let machine = LobbyMachine::new(db_pool.clone(), hub.clone());

    let mut conn = db_pool.acquire().await.unwrap();
    let game = store::insert_game(&mut conn, "Deep Rock Galactic", "co-op mining", None)
        .await
        .unwrap()
        .id;
    drop(conn);

    Fixture { db_pool, hub, machine, game, _dir: dir }
}

impl Fixture {
    pub async fn user(&self, nickname: &str) -> UserId {
        auth::find_or_create_user(&self.db_pool, nickname).await.unwrap().id
    }

    pub async fn game(&self, name: &str) -> GameId {
        let mut conn = self.db_pool.acquire().await.unwrap();
        store::insert_game(&mut conn, name, "", None).await.unwrap().id
    }

    pub fn input(&self, max_players: i64) -> LobbyInput {
        LobbyInput {
            game_id: self.game,
            description: "chill runs".to_owned(),
            max_players,
        }
    }

    pub async fn current_lobby(&self, user_id: UserId) -> Option<LobbyId> {
        let mut conn = self.db_pool.acquire().await.unwrap();
        store::current_lobby(&mut conn, user_id).await.unwrap()
    }

    pub async fn system_messages(&self, lobby_id: LobbyId) -> Vec<String> {
        sqlx::query_as::<_, (String,)>(
            "SELECT content FROM messages WHERE lobby_id=? AND kind='system' ORDER BY created_at, rowid",
        )
        .bind(lobby_id)
        .fetch_all(&self.db_pool)
        .await
        .unwrap()
        .into_iter()
        .map(|(content,)| content)
        .collect()
    }

    /// Membership is consistent from both sides, every lobby is within
    /// capacity and its host is one of its members.
    pub async fn assert_invariants(&self) {
        let mut conn = self.db_pool.acquire().await.unwrap();
        let lobbies: Vec<db::Lobby> =
            sqlx::query_as("SELECT id,game_id,host_id,description,max_players,created_at FROM lobbies")
                .fetch_all(&mut *conn)
                .await
                .unwrap();

        for lobby in lobbies {
            let members = store::members(&mut conn, lobby.id).await.unwrap();
            assert!(!members.is_empty(), "empty lobby {} still exists", lobby.id);
            assert!(members.len() as i64 <= lobby.max_players, "lobby {} over capacity", lobby.id);
            assert!(
                members.iter().any(|member| member.id == lobby.host_id),
                "host of lobby {} is not a member",
                lobby.id
            );
        }

        let (dangling,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users u WHERE u.current_lobby_id IS NOT NULL
             AND NOT EXISTS (SELECT 1 FROM lobbies l WHERE l.id = u.current_lobby_id)",
        )
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(dangling, 0, "users point at deleted lobbies");
    }
}

/// Next event on the subscription as JSON, failing the test after a second.
pub async fn next_event(subscription: &mut Subscription) -> Value {
    let payload = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed");
    serde_json::from_str(&payload).unwrap()
}

pub async fn next_kind(subscription: &mut Subscription) -> String {
    next_event(subscription).await["type"].as_str().unwrap().to_owned()
}

pub async fn assert_closed(subscription: &mut Subscription) {
    let next = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timed out waiting for the subscription to close");
    assert!(next.is_none(), "expected the subscription to be closed, got {next:?}");
}
