use std::convert::Infallible;

use axum::{
    debug_handler,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{stream, Stream};

use crate::{
    db::LobbyId,
    hub::{Subscription, EVENT_NAME},
    machine::LobbyMachine,
    session::CurrentUser,
    AppResult,
};

/// Streams the lobby's events until the client goes away or the
/// subscription is closed. Dropping the stream unsubscribes.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn lobby_events(
    State(machine): State<LobbyMachine>,
    CurrentUser(user_id): CurrentUser,
    Path(lobby_id): Path<LobbyId>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = machine.subscribe(user_id, lobby_id).await?;
    Ok(Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default()))
}

fn event_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let payload = subscription.recv().await?;
        let event = Event::default().event(EVENT_NAME).data(&*payload);
        Some((Ok(event), subscription))
    })
}
