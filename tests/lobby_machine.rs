//! Lobby lifecycle, membership invariants and the events they produce.

mod common;

use std::sync::Arc;

use common::{assert_closed, fixture, next_event, next_kind};
use playmatch::{
    db::LobbyId,
    machine::{LobbyInput, Paging},
    AppError,
};

// =============================================================================
// Create / Join
// =============================================================================

#[tokio::test]
async fn create_makes_the_host_the_sole_member() {
    let fx = fixture().await;
    let alice = fx.user("alice").await;

    let lobby = fx.machine.create_lobby(alice, fx.input(4)).await.unwrap();

    assert_eq!(lobby.host.id, alice);
    assert_eq!(lobby.member_count, 1);
    assert_eq!(lobby.members[0].id, alice);
    assert!(lobby.is_open);
    assert_eq!(fx.current_lobby(alice).await, Some(lobby.id));
    assert_eq!(fx.system_messages(lobby.id).await, ["User alice created the lobby."]);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn create_rejects_a_user_already_in_a_lobby() {
    let fx = fixture().await;
    let alice = fx.user("alice").await;
    let first = fx.machine.create_lobby(alice, fx.input(4)).await.unwrap();

    let err = fx.machine.create_lobby(alice, fx.input(4)).await.unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)), "{err:?}");
    assert_eq!(fx.current_lobby(alice).await, Some(first.id));
    fx.assert_invariants().await;
}

#[tokio::test]
async fn create_validates_its_input() {
    let fx = fixture().await;
    let alice = fx.user("alice").await;

    let err = fx.machine.create_lobby(alice, fx.input(1)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err:?}");

    let err = fx.machine.create_lobby(alice, fx.input(11)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err:?}");

    let unknown_game = LobbyInput { game_id: Default::default(), ..fx.input(4) };
    let err = fx.machine.create_lobby(alice, unknown_game).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");

    assert_eq!(fx.current_lobby(alice).await, None);
}

#[tokio::test]
async fn third_player_cannot_join_a_lobby_for_two() {
    let fx = fixture().await;
    let (a, b, c) = (fx.user("a").await, fx.user("b").await, fx.user("c").await);
    let lobby = fx.machine.create_lobby(a, fx.input(2)).await.unwrap();

    let joined = fx.machine.join_lobby(b, lobby.id).await.unwrap();
    assert_eq!(joined.member_count, 2);
    assert!(!joined.is_open);

    let err = fx.machine.join_lobby(c, lobby.id).await.unwrap_err();
    match err {
        AppError::Conflict(msg) => assert_eq!(msg, "lobby is full"),
        other => panic!("expected conflict, got {other:?}"),
    }

    let lobby = fx.machine.get_lobby(lobby.id).await.unwrap();
    let members: Vec<_> = lobby.members.iter().map(|m| m.id).collect();
    assert_eq!(members, [a, b]);
    assert_eq!(fx.current_lobby(c).await, None);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn join_failures() {
    let fx = fixture().await;
    let (a, b) = (fx.user("a").await, fx.user("b").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();

    let err = fx.machine.join_lobby(b, LobbyId::new()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");

    let err = fx.machine.join_lobby(a, lobby.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "{err:?}");

    let other = fx.machine.create_lobby(b, fx.input(4)).await.unwrap();
    let err = fx.machine.join_lobby(b, lobby.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "{err:?}");
    assert_eq!(fx.current_lobby(b).await, Some(other.id));
    fx.assert_invariants().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_for_the_last_seat_admit_exactly_one() {
    let fx = fixture().await;
    let host = fx.user("host").await;
    let lobby = fx.machine.create_lobby(host, fx.input(2)).await.unwrap();

    let mut joiners = Vec::new();
    for n in 0..8 {
        joiners.push(fx.user(&format!("joiner{n}")).await);
    }

    let machine = Arc::new(fx.machine.clone());
    let tasks: Vec<_> = joiners
        .iter()
        .map(|&user_id| {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.join_lobby(user_id, lobby.id).await })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(AppError::Conflict(msg)) => assert_eq!(msg, "lobby is full"),
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(fx.machine.get_lobby(lobby.id).await.unwrap().member_count, 2);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn join_is_broadcast_to_members() {
    let fx = fixture().await;
    let (a, b) = (fx.user("a").await, fx.user("b").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();
    let mut events = fx.machine.subscribe(a, lobby.id).await.unwrap();

    fx.machine.join_lobby(b, lobby.id).await.unwrap();

    let joined = next_event(&mut events).await;
    assert_eq!(joined["type"], "user_joined");
    assert_eq!(joined["payload"]["nickname"], "b");
    let notice = next_event(&mut events).await;
    assert_eq!(notice["type"], "new_message");
    assert_eq!(notice["payload"]["type"], "system");
    assert_eq!(notice["payload"]["content"], "User b joined the lobby.");
    assert!(notice["payload"].get("user").is_none());
}

// =============================================================================
// Leave
// =============================================================================

#[tokio::test]
async fn host_leaving_hands_the_lobby_to_the_next_member() {
    let fx = fixture().await;
    let (alice, bob) = (fx.user("alice").await, fx.user("bob").await);
    let lobby = fx.machine.create_lobby(alice, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(bob, lobby.id).await.unwrap();
    let mut events = fx.machine.subscribe(bob, lobby.id).await.unwrap();

    let outcome = fx.machine.leave_lobby(alice).await.unwrap();

    assert_eq!(outcome.lobby_id, lobby.id);
    assert_eq!(outcome.new_host.as_ref().map(|h| h.id), Some(bob));
    let after = outcome.lobby.expect("lobby survives");
    assert_eq!(after.host.id, bob);
    assert_eq!(after.member_count, 1);
    assert_eq!(fx.current_lobby(alice).await, None);

    assert_eq!(next_kind(&mut events).await, "user_left");
    assert_eq!(next_kind(&mut events).await, "new_message");
    let host_changed = next_event(&mut events).await;
    assert_eq!(host_changed["type"], "host_changed");
    assert_eq!(host_changed["payload"]["nickname"], "bob");
    let notice = next_event(&mut events).await;
    assert_eq!(notice["payload"]["content"], "User bob is now the host.");

    assert_eq!(
        fx.system_messages(lobby.id).await,
        [
            "User alice created the lobby.",
            "User bob joined the lobby.",
            "User alice left the lobby.",
            "User bob is now the host.",
        ]
    );
    fx.assert_invariants().await;
}

#[tokio::test]
async fn successor_is_the_earliest_joined_member() {
    let fx = fixture().await;
    let (a, b, c) = (fx.user("a").await, fx.user("b").await, fx.user("c").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(b, lobby.id).await.unwrap();
    fx.machine.join_lobby(c, lobby.id).await.unwrap();

    let outcome = fx.machine.leave_lobby(a).await.unwrap();
    assert_eq!(outcome.new_host.map(|h| h.id), Some(b));

    let outcome = fx.machine.leave_lobby(b).await.unwrap();
    assert_eq!(outcome.new_host.map(|h| h.id), Some(c));
    fx.assert_invariants().await;
}

#[tokio::test]
async fn non_host_leaving_keeps_the_host() {
    let fx = fixture().await;
    let (a, b) = (fx.user("a").await, fx.user("b").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(b, lobby.id).await.unwrap();
    let mut leaver_events = fx.machine.subscribe(b, lobby.id).await.unwrap();

    let outcome = fx.machine.leave_lobby(b).await.unwrap();

    assert!(outcome.new_host.is_none());
    assert_eq!(outcome.lobby.unwrap().host.id, a);
    // the departing member's own stream gets the news, then ends
    assert_eq!(next_kind(&mut leaver_events).await, "user_left");
    assert_eq!(next_kind(&mut leaver_events).await, "new_message");
    assert_closed(&mut leaver_events).await;
    fx.assert_invariants().await;
}

#[tokio::test]
async fn last_member_out_deletes_the_lobby() {
    let fx = fixture().await;
    let alice = fx.user("alice").await;
    let lobby = fx.machine.create_lobby(alice, fx.input(4)).await.unwrap();
    let mut events = fx.machine.subscribe(alice, lobby.id).await.unwrap();

    let outcome = fx.machine.leave_lobby(alice).await.unwrap();

    assert!(outcome.lobby.is_none());
    assert!(outcome.new_host.is_none());
    assert_eq!(next_kind(&mut events).await, "user_left");
    let deleted = next_event(&mut events).await;
    assert_eq!(deleted["type"], "lobby_deleted");
    assert_eq!(deleted["payload"]["lobby_id"], lobby.id.to_string());
    assert_closed(&mut events).await;
    assert_eq!(fx.hub.subscriber_count(lobby.id), 0);

    let err = fx.machine.get_lobby(lobby.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");
    assert!(fx.system_messages(lobby.id).await.is_empty());
    fx.assert_invariants().await;
}

#[tokio::test]
async fn leaving_without_a_lobby_is_not_found() {
    let fx = fixture().await;
    let alice = fx.user("alice").await;

    let err = fx.machine.leave_lobby(alice).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");
}

// =============================================================================
// Kick
// =============================================================================

#[tokio::test]
async fn kick_rules() {
    let fx = fixture().await;
    let (host, guest, outsider) = (fx.user("host").await, fx.user("guest").await, fx.user("outsider").await);
    let lobby = fx.machine.create_lobby(host, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(guest, lobby.id).await.unwrap();

    let err = fx.machine.kick_member(guest, lobby.id, host).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "{err:?}");

    let err = fx.machine.kick_member(host, lobby.id, host).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err:?}");

    let err = fx.machine.kick_member(host, lobby.id, outsider).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");

    let err = fx.machine.kick_member(host, LobbyId::new(), guest).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");

    assert_eq!(fx.current_lobby(guest).await, Some(lobby.id));
    fx.assert_invariants().await;
}

#[tokio::test]
async fn kicked_member_is_removed_and_their_stream_ends() {
    let fx = fixture().await;
    let (host, guest) = (fx.user("host").await, fx.user("guest").await);
    let lobby = fx.machine.create_lobby(host, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(guest, lobby.id).await.unwrap();
    let mut host_events = fx.machine.subscribe(host, lobby.id).await.unwrap();
    let mut guest_events = fx.machine.subscribe(guest, lobby.id).await.unwrap();

    let after = fx.machine.kick_member(host, lobby.id, guest).await.unwrap();

    assert_eq!(after.host.id, host);
    assert_eq!(after.member_count, 1);
    assert_eq!(fx.current_lobby(guest).await, None);

    let kicked = next_event(&mut host_events).await;
    assert_eq!(kicked["type"], "user_kicked");
    assert_eq!(kicked["payload"]["nickname"], "guest");
    assert_eq!(next_event(&mut host_events).await["payload"]["content"], "User guest was kicked from the lobby.");

    assert_eq!(next_kind(&mut guest_events).await, "user_kicked");
    assert_eq!(next_kind(&mut guest_events).await, "new_message");
    assert_closed(&mut guest_events).await;
    assert_eq!(fx.hub.subscriber_count(lobby.id), 1);

    let err = fx.machine.post_message(guest, lobby.id, "let me back in").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "{err:?}");
    fx.assert_invariants().await;
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn update_is_host_only() {
    let fx = fixture().await;
    let (host, guest) = (fx.user("host").await, fx.user("guest").await);
    let lobby = fx.machine.create_lobby(host, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(guest, lobby.id).await.unwrap();

    let err = fx.machine.update_lobby(guest, lobby.id, fx.input(6)).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "{err:?}");

    let err = fx.machine.update_lobby(host, LobbyId::new(), fx.input(6)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");

    assert_eq!(fx.machine.get_lobby(lobby.id).await.unwrap().max_players, 4);
}

#[tokio::test]
async fn changing_the_game_is_announced() {
    let fx = fixture().await;
    let host = fx.user("host").await;
    let lobby = fx.machine.create_lobby(host, fx.input(4)).await.unwrap();
    let mut events = fx.machine.subscribe(host, lobby.id).await.unwrap();
    let helldivers = fx.game("Helldivers 2").await;

    let input = LobbyInput {
        game_id: helldivers,
        description: "dive".to_owned(),
        max_players: 4,
    };
    let updated = fx.machine.update_lobby(host, lobby.id, input).await.unwrap();

    assert_eq!(updated.game.id, helldivers);
    assert_eq!(updated.description, "dive");

    let notice = next_event(&mut events).await;
    assert_eq!(notice["payload"]["content"], "Lobby game changed to Helldivers 2.");
    let game_changed = next_event(&mut events).await;
    assert_eq!(game_changed["type"], "lobby_game_changed");
    assert_eq!(game_changed["payload"]["name"], "Helldivers 2");
    let lobby_updated = next_event(&mut events).await;
    assert_eq!(lobby_updated["type"], "lobby_updated");
    assert_eq!(lobby_updated["payload"]["description"], "dive");
}

#[tokio::test]
async fn same_game_update_only_reports_the_lobby() {
    let fx = fixture().await;
    let host = fx.user("host").await;
    let lobby = fx.machine.create_lobby(host, fx.input(4)).await.unwrap();
    let mut events = fx.machine.subscribe(host, lobby.id).await.unwrap();

    fx.machine.update_lobby(host, lobby.id, fx.input(5)).await.unwrap();

    let updated = next_event(&mut events).await;
    assert_eq!(updated["type"], "lobby_updated");
    assert_eq!(updated["payload"]["max_players"], 5);
    assert_eq!(fx.system_messages(lobby.id).await.len(), 1);
}

#[tokio::test]
async fn shrinking_below_the_member_count_evicts_nobody() {
    let fx = fixture().await;
    let (a, b, c) = (fx.user("a").await, fx.user("b").await, fx.user("c").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(b, lobby.id).await.unwrap();
    fx.machine.join_lobby(c, lobby.id).await.unwrap();

    let updated = fx.machine.update_lobby(a, lobby.id, fx.input(2)).await.unwrap();

    assert_eq!(updated.member_count, 3);
    assert_eq!(updated.max_players, 2);
    assert!(!updated.is_open);

    let d = fx.user("d").await;
    let err = fx.machine.join_lobby(d, lobby.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "{err:?}");
}

// =============================================================================
// Chat & subscriptions
// =============================================================================

#[tokio::test]
async fn messages_arrive_in_the_order_they_were_posted() {
    let fx = fixture().await;
    let (a, b) = (fx.user("a").await, fx.user("b").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();
    fx.machine.join_lobby(b, lobby.id).await.unwrap();
    let mut events = fx.machine.subscribe(b, lobby.id).await.unwrap();

    let first = fx.machine.post_message(a, lobby.id, "ready?").await.unwrap();
    fx.machine.post_message(b, lobby.id, "go").await.unwrap();

    assert_eq!(first.user.as_ref().map(|u| u.nickname.as_str()), Some("a"));

    let one = next_event(&mut events).await;
    let two = next_event(&mut events).await;
    assert_eq!(one["payload"]["content"], "ready?");
    assert_eq!(one["payload"]["type"], "text");
    assert_eq!(two["payload"]["content"], "go");

    let history = fx.machine.messages(a, lobby.id, Paging::new(None, None, 50, 200)).await.unwrap();
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["User a created the lobby.", "User b joined the lobby.", "ready?", "go"]);

    let newest = fx.machine.messages(a, lobby.id, Paging::new(Some(1), Some(2), 50, 200)).await.unwrap();
    let contents: Vec<_> = newest.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["ready?", "go"]);
}

#[tokio::test]
async fn chat_is_for_members_only() {
    let fx = fixture().await;
    let (a, outsider) = (fx.user("a").await, fx.user("outsider").await);
    let lobby = fx.machine.create_lobby(a, fx.input(4)).await.unwrap();

    let err = fx.machine.post_message(outsider, lobby.id, "hi").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "{err:?}");

    let err = fx.machine.messages(outsider, lobby.id, Paging::new(None, None, 50, 200)).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)), "{err:?}");

    let err = fx.machine.subscribe(outsider, lobby.id).await.err().unwrap();
    assert!(matches!(err, AppError::Forbidden(_)), "{err:?}");

    let err = fx.machine.post_message(a, lobby.id, "   ").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err:?}");
}

#[tokio::test]
async fn failed_transitions_emit_nothing() {
    let fx = fixture().await;
    let (a, b, c) = (fx.user("a").await, fx.user("b").await, fx.user("c").await);
    let lobby = fx.machine.create_lobby(a, fx.input(2)).await.unwrap();
    fx.machine.join_lobby(b, lobby.id).await.unwrap();
    let mut events = fx.machine.subscribe(a, lobby.id).await.unwrap();

    fx.machine.join_lobby(c, lobby.id).await.unwrap_err();
    fx.machine.kick_member(b, lobby.id, a).await.unwrap_err();
    fx.machine.post_message(a, lobby.id, "after the failures").await.unwrap();

    let next = next_event(&mut events).await;
    assert_eq!(next["payload"]["content"], "after the failures");
    assert_eq!(fx.system_messages(lobby.id).await.len(), 2);
}

#[tokio::test]
async fn search_lists_only_open_lobbies() {
    let fx = fixture().await;
    let (a, b, c) = (fx.user("a").await, fx.user("b").await, fx.user("c").await);
    let other_game = fx.game("Lethal Company").await;

    let full = fx.machine.create_lobby(a, fx.input(2)).await.unwrap();
    fx.machine.join_lobby(b, full.id).await.unwrap();
    let open = fx.machine.create_lobby(c, fx.input(4)).await.unwrap();

    let paging = Paging::new(None, None, 10, 100);
    let found = fx.machine.search_open(None, paging).await.unwrap();
    let ids: Vec<_> = found.iter().map(|l| l.id).collect();
    assert_eq!(ids, [open.id]);

    let found = fx.machine.search_open(Some(other_game), paging).await.unwrap();
    assert!(found.is_empty());

    fx.machine.leave_lobby(b).await.unwrap();
    let found = fx.machine.search_open(Some(fx.game), paging).await.unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn lock_entries_do_not_outlive_their_transitions() {
    let fx = fixture().await;
    let (host, guest) = (fx.user("host").await, fx.user("guest").await);
    let lobby = fx.machine.create_lobby(host, fx.input(4)).await.unwrap();

    for _ in 0..3 {
        let unknown = LobbyId::new();
        fx.machine.join_lobby(guest, unknown).await.unwrap_err();
        fx.machine.kick_member(host, unknown, guest).await.unwrap_err();
        fx.machine.update_lobby(host, unknown, fx.input(4)).await.unwrap_err();
        fx.machine.post_message(guest, unknown, "anyone?").await.unwrap_err();
        fx.machine.subscribe(guest, unknown).await.err().unwrap();
        fx.machine.create_lobby(host, fx.input(4)).await.unwrap_err();
    }
    fx.machine.join_lobby(guest, lobby.id).await.unwrap();
    fx.machine.leave_lobby(guest).await.unwrap();

    assert_eq!(fx.machine.locked_lobbies(), 0);
}
