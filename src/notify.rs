//! Turns committed lobby transitions into hub broadcasts.

use serde::Serialize;

use crate::{
    db::{LobbyId, UserId},
    hub::Hub,
    views::{GameView, LobbyView, MessageView, PublicUser},
};

/// Wire form: `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LobbyEvent {
    LobbyCreated(LobbyView),
    UserJoined(PublicUser),
    UserLeft(PublicUser),
    UserKicked(PublicUser),
    HostChanged(PublicUser),
    LobbyUpdated(LobbyView),
    LobbyDeleted { lobby_id: LobbyId },
    LobbyGameChanged(GameView),
    NewMessage(MessageView),
}

impl LobbyEvent {
    pub fn kind(&self) -> &'static str {
        use LobbyEvent::*;
        match self {
            LobbyCreated(_) => "lobby_created",
            UserJoined(_) => "user_joined",
            UserLeft(_) => "user_left",
            UserKicked(_) => "user_kicked",
            HostChanged(_) => "host_changed",
            LobbyUpdated(_) => "lobby_updated",
            LobbyDeleted { .. } => "lobby_deleted",
            LobbyGameChanged(_) => "lobby_game_changed",
            NewMessage(_) => "new_message",
        }
    }
}

/// What happened to the lobby after a member left.
#[derive(Debug, Clone)]
pub enum Departure {
    Stayed,
    HostChanged { host: PublicUser, notice: MessageView },
    Deleted,
}

/// A transition that has already committed, described by post-commit state.
#[derive(Debug, Clone)]
pub enum Transition {
    Created { lobby: LobbyView, notice: MessageView },
    Joined { lobby_id: LobbyId, user: PublicUser, notice: MessageView },
    Left { lobby_id: LobbyId, user: PublicUser, notice: Option<MessageView>, departure: Departure },
    Kicked { lobby_id: LobbyId, user: PublicUser, notice: MessageView },
    Updated { lobby: LobbyView, game_changed: Option<MessageView> },
    Posted { message: MessageView },
}

impl Transition {
    pub fn lobby_id(&self) -> LobbyId {
        use Transition::*;
        match self {
            Created { lobby, .. } | Updated { lobby, .. } => lobby.id,
            Joined { lobby_id, .. } | Left { lobby_id, .. } | Kicked { lobby_id, .. } => *lobby_id,
            Posted { message } => message.lobby_id,
        }
    }

    /// Events in the order subscribers see them.
    pub fn events(&self) -> Vec<LobbyEvent> {
        use LobbyEvent::*;
        match self.clone() {
            Transition::Created { lobby, notice } => vec![LobbyCreated(lobby), NewMessage(notice)],
            Transition::Joined { user, notice, .. } => vec![UserJoined(user), NewMessage(notice)],
            Transition::Left { lobby_id, user, notice, departure } => {
                let mut events = vec![UserLeft(user)];
                events.extend(notice.map(NewMessage));
                match departure {
                    Departure::Stayed => {}
                    Departure::HostChanged { host, notice } => {
                        events.push(HostChanged(host));
                        events.push(NewMessage(notice));
                    }
                    Departure::Deleted => events.push(LobbyDeleted { lobby_id }),
                }
                events
            }
            Transition::Kicked { user, notice, .. } => vec![UserKicked(user), NewMessage(notice)],
            Transition::Updated { lobby, game_changed } => {
                let mut events = Vec::new();
                if let Some(notice) = game_changed {
                    events.push(NewMessage(notice));
                    events.push(LobbyGameChanged(lobby.game.clone()));
                }
                events.push(LobbyUpdated(lobby));
                events
            }
            Transition::Posted { message } => vec![NewMessage(message)],
        }
    }

    /// The user whose live subscriptions must end with this transition.
    fn revoked_user(&self) -> Option<UserId> {
        match self {
            Transition::Left { user, departure, .. } if !matches!(departure, Departure::Deleted) => Some(user.id),
            Transition::Kicked { user, .. } => Some(user.id),
            _ => None,
        }
    }

    fn deletes_lobby(&self) -> bool {
        matches!(self, Transition::Left { departure: Departure::Deleted, .. })
    }
}

#[derive(Clone)]
pub struct Notifier {
    hub: Hub,
}

impl Notifier {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Broadcasts the transition's events. Failures are logged and swallowed:
    /// the transition has committed regardless.
    pub fn committed(&self, transition: Transition) {
        let lobby_id = transition.lobby_id();

        for event in transition.events() {
            match self.hub.broadcast(lobby_id, &event) {
                Ok(delivery) => tracing::debug!(
                    %lobby_id,
                    event = event.kind(),
                    delivered = delivery.delivered,
                    dropped = delivery.dropped,
                    "broadcast"
                ),
                Err(err) => tracing::warn!(%lobby_id, event = event.kind(), "broadcast failed: {err}"),
            }
        }

        if let Some(user_id) = transition.revoked_user() {
            self.hub.disconnect_user(lobby_id, user_id);
        }
        if transition.deletes_lobby() {
            self.hub.close_lobby(lobby_id);
        }
    }
}
