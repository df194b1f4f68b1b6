//! Lobby membership state machine.
//!
//! The only writer of lobby and membership rows. Each transition holds the
//! lobby's mutex for its whole unit of work (validate, write, commit,
//! notify), so mutations of one lobby commit and broadcast in one order while
//! different lobbies proceed in parallel. Capacity and "not already in a
//! lobby" are re-checked by the seat-claiming UPDATE itself, not only by the
//! earlier reads.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    appresult::{AppError, AppResult},
    db::{self, GameId, LobbyId, MessageKind, UserId},
    hub::{Hub, Subscription},
    notify::{Departure, Notifier, Transition},
    store,
    views::{self, LobbyView, MessageView, PublicUser},
};

pub const MIN_PLAYERS: i64 = 2;
pub const MAX_PLAYERS: i64 = 10;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct LobbyInput {
    pub game_id: GameId,
    #[serde(default)]
    pub description: String,
    pub max_players: i64,
}

impl LobbyInput {
    fn validate(&self) -> AppResult<()> {
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&self.max_players) {
            return Err(AppError::validation(format!(
                "max_players must be between {MIN_PLAYERS} and {MAX_PLAYERS}"
            )));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(AppError::validation(format!(
                "description must be at most {MAX_DESCRIPTION_LEN} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveOutcome {
    pub lobby_id: LobbyId,
    /// The lobby after the departure, `None` if it was deleted.
    pub lobby: Option<LobbyView>,
    pub new_host: Option<PublicUser>,
}

/// 1-based page of a listing.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub page: u32,
    pub limit: u32,
}

impl Paging {
    pub fn new(page: Option<u32>, limit: Option<u32>, default_limit: u32, max_limit: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(default_limit).clamp(1, max_limit),
        }
    }

    fn limit(&self) -> i64 {
        self.limit.into()
    }

    fn offset(&self) -> i64 {
        i64::from(self.page - 1) * self.limit()
    }
}

type LockMap = DashMap<LobbyId, Weak<Mutex<()>>>;

/// One lobby's mutation lock, held for a whole transition. The map entry
/// lives only as long as some guard or waiter holds the mutex.
struct LobbyGuard {
    lobby_id: LobbyId,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LobbyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.lobby_id, |_, mutex| mutex.strong_count() == 0);
    }
}

#[derive(Clone)]
pub struct LobbyMachine {
    db_pool: SqlitePool,
    locks: Arc<LockMap>,
    notifier: Notifier,
}

impl LobbyMachine {
    pub fn new(db_pool: SqlitePool, hub: Hub) -> Self {
        Self {
            db_pool,
            locks: Arc::new(DashMap::new()),
            notifier: Notifier::new(hub),
        }
    }

    pub fn hub(&self) -> &Hub {
        self.notifier.hub()
    }

    /// Lobbies that currently have a lock entry, held or awaited.
    pub fn locked_lobbies(&self) -> usize {
        self.locks.len()
    }

    async fn lock(&self, lobby_id: LobbyId) -> LobbyGuard {
        let mut held = LobbyGuard {
            lobby_id,
            locks: Arc::clone(&self.locks),
            guard: None,
        };
        let mutex = {
            let mut entry = self.locks.entry(lobby_id).or_default();
            match entry.upgrade() {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(Mutex::new(()));
                    *entry = Arc::downgrade(&mutex);
                    mutex
                }
            }
        };
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    pub async fn create_lobby(&self, host_id: UserId, input: LobbyInput) -> AppResult<LobbyView> {
        input.validate()?;

        let lobby_id = LobbyId::new();
        let _guard = self.lock(lobby_id).await;
        let mut tx = db::begin_write(&self.db_pool).await?;

        let host = store::user(&mut tx, host_id)
            .await?
            .ok_or_else(|| AppError::not_found("user not found"))?;
        if host.current_lobby_id.is_some() {
            return Err(AppError::conflict("user is already in a lobby"));
        }
        if store::game(&mut tx, input.game_id).await?.is_none() {
            return Err(AppError::not_found("game not found"));
        }

        let now = OffsetDateTime::now_utc();
        let lobby = db::Lobby {
            id: lobby_id,
            game_id: input.game_id,
            host_id,
            description: input.description,
            max_players: input.max_players,
            created_at: now,
        };
        store::insert_lobby(&mut tx, &lobby).await?;
        if !store::claim_seat(&mut tx, host_id, lobby_id, now).await? {
            return Err(AppError::conflict("user is already in a lobby"));
        }
        let notice = system_message(&mut tx, lobby_id, format!("User {} created the lobby.", host.nickname)).await?;
        let view = views::lobby_view_of(&mut tx, lobby).await?;

        tx.commit().await?;
        tracing::info!(%lobby_id, %host_id, "lobby created");

        self.notifier.committed(Transition::Created { lobby: view.clone(), notice });
        Ok(view)
    }

    pub async fn join_lobby(&self, user_id: UserId, lobby_id: LobbyId) -> AppResult<LobbyView> {
        let _guard = self.lock(lobby_id).await;
        let mut tx = db::begin_write(&self.db_pool).await?;

        let user = store::user(&mut tx, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("user not found"))?;
        if user.current_lobby_id.is_some() {
            return Err(AppError::conflict("user is already in a lobby"));
        }
        let lobby = store::lobby(&mut tx, lobby_id)
            .await?
            .ok_or_else(|| AppError::not_found("lobby not found"))?;
        if store::member_count(&mut tx, lobby_id).await? >= lobby.max_players {
            return Err(AppError::conflict("lobby is full"));
        }
        if !store::claim_seat(&mut tx, user_id, lobby_id, OffsetDateTime::now_utc()).await? {
            // joined another lobby since the first read
            if store::current_lobby(&mut tx, user_id).await?.is_some() {
                return Err(AppError::conflict("user is already in a lobby"));
            }
            return Err(AppError::conflict("lobby is full"));
        }
        let notice = system_message(&mut tx, lobby_id, format!("User {} joined the lobby.", user.nickname)).await?;
        let view = views::lobby_view_of(&mut tx, lobby).await?;

        tx.commit().await?;
        tracing::info!(%lobby_id, %user_id, "user joined lobby");

        self.notifier.committed(Transition::Joined {
            lobby_id,
            user: PublicUser::from(&user),
            notice,
        });
        Ok(view)
    }

    /// Leaves whatever lobby the user is in. The host role passes to the
    /// earliest-joined remaining member; the last member out deletes the lobby.
    pub async fn leave_lobby(&self, user_id: UserId) -> AppResult<LeaveOutcome> {
        loop {
            let lobby_id = {
                let mut conn = self.db_pool.acquire().await?;
                store::current_lobby(&mut conn, user_id).await?
            }
            .ok_or_else(|| AppError::not_found("user is not in a lobby"))?;

            let _guard = self.lock(lobby_id).await;
            let mut tx = db::begin_write(&self.db_pool).await?;

            let user = store::user(&mut tx, user_id)
                .await?
                .ok_or_else(|| AppError::not_found("user is not in a lobby"))?;
            if user.current_lobby_id != Some(lobby_id) {
                // moved between the lookup and the lock
                continue;
            }
            let lobby = store::lobby(&mut tx, lobby_id)
                .await?
                .ok_or_else(|| AppError::not_found("lobby not found"))?;

            store::release_seat(&mut tx, user_id, lobby_id).await?;
            let remaining = store::members(&mut tx, lobby_id).await?;

            let (notice, departure, view) = match remaining.first() {
                None => {
                    store::delete_lobby(&mut tx, lobby_id).await?;
                    (None, Departure::Deleted, None)
                }
                Some(successor) => {
                    let notice =
                        system_message(&mut tx, lobby_id, format!("User {} left the lobby.", user.nickname)).await?;
                    let departure = if lobby.host_id == user_id {
                        store::set_host(&mut tx, lobby_id, successor.id).await?;
                        let notice =
                            system_message(&mut tx, lobby_id, format!("User {} is now the host.", successor.nickname))
                                .await?;
                        Departure::HostChanged { host: PublicUser::from(successor), notice }
                    } else {
                        Departure::Stayed
                    };
                    let view = views::lobby_view(&mut tx, lobby_id).await?;
                    (Some(notice), departure, view)
                }
            };

            tx.commit().await?;
            tracing::info!(%lobby_id, %user_id, "user left lobby");

            let new_host = match &departure {
                Departure::HostChanged { host, .. } => {
                    tracing::info!(%lobby_id, host_id = %host.id, "host changed");
                    Some(host.clone())
                }
                Departure::Deleted => {
                    tracing::info!(%lobby_id, "lobby deleted");
                    None
                }
                Departure::Stayed => None,
            };

            self.notifier.committed(Transition::Left {
                lobby_id,
                user: PublicUser::from(&user),
                notice,
                departure,
            });
            return Ok(LeaveOutcome { lobby_id, lobby: view, new_host });
        }
    }

    pub async fn kick_member(&self, host_id: UserId, lobby_id: LobbyId, target_id: UserId) -> AppResult<LobbyView> {
        let _guard = self.lock(lobby_id).await;
        let mut tx = db::begin_write(&self.db_pool).await?;

        let lobby = store::lobby(&mut tx, lobby_id)
            .await?
            .ok_or_else(|| AppError::not_found("lobby not found"))?;
        if lobby.host_id != host_id {
            return Err(AppError::forbidden("only the host can kick members"));
        }
        if target_id == lobby.host_id {
            return Err(AppError::validation("the host cannot kick themselves"));
        }
        let target = store::user(&mut tx, target_id)
            .await?
            .filter(|user| user.current_lobby_id == Some(lobby_id))
            .ok_or_else(|| AppError::not_found("member not found in this lobby"))?;

        store::release_seat(&mut tx, target_id, lobby_id).await?;
        let notice =
            system_message(&mut tx, lobby_id, format!("User {} was kicked from the lobby.", target.nickname)).await?;
        let view = views::lobby_view_of(&mut tx, lobby).await?;

        tx.commit().await?;
        tracing::info!(%lobby_id, %host_id, %target_id, "member kicked");

        self.notifier.committed(Transition::Kicked {
            lobby_id,
            user: PublicUser::from(&target),
            notice,
        });
        Ok(view)
    }

    /// Host-only. A `max_players` below the current member count is accepted
    /// and evicts nobody; the lobby just stops being open.
    pub async fn update_lobby(&self, host_id: UserId, lobby_id: LobbyId, input: LobbyInput) -> AppResult<LobbyView> {
        input.validate()?;

        let _guard = self.lock(lobby_id).await;
        let mut tx = db::begin_write(&self.db_pool).await?;

        let lobby = store::lobby(&mut tx, lobby_id)
            .await?
            .ok_or_else(|| AppError::not_found("lobby not found"))?;
        if lobby.host_id != host_id {
            return Err(AppError::forbidden("only the host can update the lobby"));
        }
        let game = store::game(&mut tx, input.game_id)
            .await?
            .ok_or_else(|| AppError::not_found("game not found"))?;

        store::update_lobby(&mut tx, lobby_id, input.game_id, &input.description, input.max_players).await?;
        let game_changed = if lobby.game_id != game.id {
            Some(system_message(&mut tx, lobby_id, format!("Lobby game changed to {}.", game.name)).await?)
        } else {
            None
        };
        let view = views::lobby_view(&mut tx, lobby_id)
            .await?
            .ok_or_else(|| AppError::not_found("lobby not found"))?;

        tx.commit().await?;
        tracing::info!(%lobby_id, %host_id, "lobby updated");

        self.notifier.committed(Transition::Updated { lobby: view.clone(), game_changed });
        Ok(view)
    }

    pub async fn post_message(&self, user_id: UserId, lobby_id: LobbyId, content: &str) -> AppResult<MessageView> {
        if content.trim().is_empty() {
            return Err(AppError::validation("content must not be empty"));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::validation(format!(
                "content must be at most {MAX_MESSAGE_LEN} characters"
            )));
        }

        let _guard = self.lock(lobby_id).await;
        let mut tx = db::begin_write(&self.db_pool).await?;

        let author = require_member(&mut tx, user_id, lobby_id).await?;
        let message = store::insert_message(&mut tx, lobby_id, Some(user_id), MessageKind::Text, content).await?;

        tx.commit().await?;
        tracing::debug!(%lobby_id, %user_id, message_id = %message.id, "message posted");

        let view = MessageView::new(message, Some(PublicUser::from(&author)));
        self.notifier.committed(Transition::Posted { message: view.clone() });
        Ok(view)
    }

    /// Registers a live subscriber. Checked under the lobby lock so a
    /// concurrent leave or kick either sees the subscriber and revokes it or
    /// commits before the membership check.
    pub async fn subscribe(&self, user_id: UserId, lobby_id: LobbyId) -> AppResult<Subscription> {
        let _guard = self.lock(lobby_id).await;
        let mut conn = self.db_pool.acquire().await?;
        require_member(&mut conn, user_id, lobby_id).await?;
        Ok(self.hub().subscribe(lobby_id, user_id))
    }

    pub async fn get_lobby(&self, lobby_id: LobbyId) -> AppResult<LobbyView> {
        let mut conn = self.db_pool.acquire().await?;
        views::lobby_view(&mut conn, lobby_id)
            .await?
            .ok_or_else(|| AppError::not_found("lobby not found"))
    }

    pub async fn search_open(&self, game_id: Option<GameId>, paging: Paging) -> AppResult<Vec<LobbyView>> {
        let mut conn = self.db_pool.acquire().await?;
        let lobbies = store::open_lobbies(&mut conn, game_id, paging.limit(), paging.offset()).await?;

        let mut result = Vec::with_capacity(lobbies.len());
        for lobby in lobbies {
            result.push(views::lobby_view_of(&mut conn, lobby).await?);
        }
        Ok(result)
    }

    pub async fn messages(&self, user_id: UserId, lobby_id: LobbyId, paging: Paging) -> AppResult<Vec<MessageView>> {
        let mut conn = self.db_pool.acquire().await?;
        require_member(&mut conn, user_id, lobby_id).await?;

        let messages = store::messages(&mut conn, lobby_id, paging.limit(), paging.offset()).await?;
        let mut result = Vec::with_capacity(messages.len());
        for message in messages {
            result.push(views::message_view(&mut conn, message).await?);
        }
        Ok(result)
    }
}

async fn require_member(conn: &mut SqliteConnection, user_id: UserId, lobby_id: LobbyId) -> AppResult<db::User> {
    store::user(conn, user_id)
        .await?
        .filter(|user| user.current_lobby_id == Some(lobby_id))
        .ok_or_else(|| AppError::forbidden("not a member of this lobby"))
}

async fn system_message(conn: &mut SqliteConnection, lobby_id: LobbyId, content: String) -> AppResult<MessageView> {
    let message = store::insert_message(conn, lobby_id, None, MessageKind::System, &content).await?;
    Ok(MessageView::new(message, None))
}
