//! Notification gateway: one task per `/ws/notifications` socket
//!
//! Each connection moves through `Connecting → Subscribed → Forwarding →
//! Closed`. The family subscription is owned by the forwarding loop, so
//! every exit path drops it and the topic's subscriber count goes back to
//! what it was before the socket connected.

use super::handlers::SharedState;
use super::ws_auth::{
    authenticate, close_for_auth_error, extract_session_token, CLOSE_LOGGED_OUT,
    CLOSE_TRY_AGAIN_LATER,
};
use crate::auth::SessionIdentity;
use crate::events::{DomainEvent, Subscription, Topic};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize, Default)]
pub struct WsQuery {
    /// Session token, for clients that can set neither headers nor cookies
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Forwarding,
    Closed,
}

/// Why a forwarding loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    ClientClosed,
    WriteFailed,
    TopicClosed,
    LoggedOut,
}

/// WebSocket upgrade handler for `/ws/notifications`
pub async fn ws_notifications(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = extract_session_token(&headers, query.token.as_deref());
    ws.on_upgrade(move |socket| handle_ws(socket, state, token))
}

/// Handle an individual notification socket
async fn handle_ws(socket: WebSocket, state: SharedState, token: Option<String>) {
    let connection = Uuid::new_v4();
    let (mut ws_sender, ws_receiver) = socket.split();
    debug!(connection = %connection, state = ?ConnectionState::Connecting, "Notification socket opened");

    // ========================================================================
    // Connecting: authenticate
    // ========================================================================
    let identity = match authenticate(token.as_deref(), state.sessions.as_ref()).await {
        Ok(identity) => identity,
        Err(e) => {
            let (code, reason) = close_for_auth_error(&e);
            debug!(connection = %connection, code, "WS auth failed: {}", e);
            send_close(&mut ws_sender, code, reason).await;
            return;
        }
    };

    // ========================================================================
    // Subscribed: attach to the family topic
    // ========================================================================
    let topic = Topic::family(identity.family_uid);
    let subscription = match state.event_bus.subscribe(&topic).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(connection = %connection, topic = %topic, "Failed to subscribe: {}", e);
            send_close(&mut ws_sender, CLOSE_TRY_AGAIN_LATER, "notifications unavailable").await;
            return;
        }
    };
    info!(
        connection = %connection,
        user = %identity.user_uid,
        topic = %topic,
        subscribers = state.event_bus.subscriber_count(&topic),
        state = ?ConnectionState::Subscribed,
        "Notification socket subscribed"
    );

    // ========================================================================
    // Forwarding → Closed
    // ========================================================================
    let cause = forward_events(
        ws_sender,
        ws_receiver,
        subscription,
        &identity,
        state.ping_interval,
    )
    .await;

    debug!(
        connection = %connection,
        cause = ?cause,
        topic = %topic,
        subscribers = state.event_bus.subscriber_count(&topic),
        state = ?ConnectionState::Closed,
        "Notification socket closed"
    );
}

/// Forward this identity's events from `subscription` to the socket until
/// either side goes away. Consumes (and so drops) the subscription.
pub async fn forward_events<Tx, Rx, E>(
    mut ws_sender: Tx,
    mut ws_receiver: Rx,
    mut subscription: Subscription,
    identity: &SessionIdentity,
    ping_every: Duration,
) -> CloseCause
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut ping_interval = interval(ping_every);
    // Skip the first immediate tick
    ping_interval.tick().await;

    debug!(user = %identity.user_uid, state = ?ConnectionState::Forwarding, "Forwarding notifications");

    loop {
        tokio::select! {
            payload = subscription.next() => {
                let Some(payload) = payload else {
                    debug!("Topic closed, shutting down WebSocket");
                    return CloseCause::TopicClosed;
                };

                let event: DomainEvent = match serde_json::from_slice(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Dropping malformed event payload: {}", e);
                        continue;
                    }
                };

                if !event.is_for(identity) {
                    continue;
                }

                if event.kind.is_logout() {
                    send_close(&mut ws_sender, CLOSE_LOGGED_OUT, "logged out").await;
                    return CloseCause::LoggedOut;
                }

                match serde_json::to_string(&event.kind) {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                            debug!("WebSocket send failed, client disconnected: {}", e);
                            return CloseCause::WriteFailed;
                        }
                    }
                    Err(e) => {
                        warn!(kind = event.kind.name(), "Failed to serialize event: {}", e);
                    }
                }
            }

            // Send periodic pings to detect dead clients
            _ = ping_interval.tick() => {
                if ws_sender.send(Message::Ping(vec![].into())).await.is_err() {
                    debug!("Ping failed, client disconnected");
                    return CloseCause::WriteFailed;
                }
            }

            // Handle incoming messages from the client (Pong, Close)
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return CloseCause::ClientClosed;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        return CloseCause::ClientClosed;
                    }
                    _ => {
                        // Pongs, and client text which this socket ignores
                    }
                }
            }
        }
    }
}

async fn send_close<Tx>(ws_sender: &mut Tx, code: u16, reason: &'static str)
where
    Tx: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::events::{Audience, EventBus, EventEmitter, EventKind, PubSub, LocalPubSub};
    use crate::test_helpers::member_added;
    use bytes::Bytes;
    use futures::channel::mpsc;
    use std::sync::Arc;

    struct Harness {
        pubsub: Arc<LocalPubSub>,
        bus: EventBus,
        identity: SessionIdentity,
        outgoing: mpsc::UnboundedReceiver<Message>,
        incoming: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        task: tokio::task::JoinHandle<CloseCause>,
    }

    async fn start(role: Role) -> Harness {
        let pubsub = Arc::new(LocalPubSub::default());
        let bus = EventBus::new(pubsub.clone());
        let identity = SessionIdentity {
            user_uid: Uuid::new_v4(),
            family_uid: Uuid::new_v4(),
            role,
        };
        let subscription = bus.subscribe(&Topic::family(identity.family_uid)).await.unwrap();
        let (out_tx, outgoing) = mpsc::unbounded::<Message>();
        let (incoming, in_rx) = mpsc::unbounded::<Result<Message, axum::Error>>();
        let task = tokio::spawn(async move {
            forward_events(out_tx, in_rx, subscription, &identity, Duration::from_secs(3600)).await
        });
        Harness {
            pubsub,
            bus,
            identity,
            outgoing,
            incoming,
            task,
        }
    }

    fn text(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forwards_kind_as_flat_json() {
        let mut h = start(Role::Parent).await;
        let added = Uuid::new_v4();
        h.bus
            .emit(DomainEvent::new(h.identity.family_uid, member_added(added)));

        let frame = text(h.outgoing.next().await.unwrap());
        assert_eq!(frame["type"], "FamilyMemberAdded");
        assert_eq!(frame["user"]["uid"], added.to_string());
        assert!(frame.get("family").is_none());

        drop(h.incoming);
        assert_eq!(h.task.await.unwrap(), CloseCause::ClientClosed);
    }

    #[tokio::test]
    async fn test_audience_and_initiator_filtering() {
        let mut h = start(Role::Child).await;
        let family = h.identity.family_uid;

        // not for children
        h.bus.notify(family, Audience::Parents, member_added(Uuid::new_v4()));
        // own action
        h.bus.emit(DomainEvent::new(
            family,
            EventKind::FamilyMemberRemoved {
                user_uid: Uuid::new_v4(),
                by: Some(h.identity.user_uid),
            },
        ));
        // addressed to this child
        h.bus.notify(
            family,
            Audience::MemberAndParents {
                user: h.identity.user_uid,
            },
            member_added(Uuid::new_v4()),
        );

        let frame = text(h.outgoing.next().await.unwrap());
        assert_eq!(frame["type"], "FamilyMemberAdded");

        drop(h.incoming);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let mut h = start(Role::Parent).await;
        let topic = Topic::family(h.identity.family_uid);
        h.pubsub
            .publish(&topic, Bytes::from_static(b"{not json"))
            .unwrap();
        h.bus.emit(DomainEvent::new(
            h.identity.family_uid,
            member_added(Uuid::new_v4()),
        ));

        let frame = text(h.outgoing.next().await.unwrap());
        assert_eq!(frame["type"], "FamilyMemberAdded");

        drop(h.incoming);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_closes_with_4000_and_releases_subscription() {
        let mut h = start(Role::Child).await;
        let topic = Topic::family(h.identity.family_uid);
        assert_eq!(h.bus.subscriber_count(&topic), 1);

        h.bus.logout(h.identity.family_uid, h.identity.user_uid);

        match h.outgoing.next().await.unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CLOSE_LOGGED_OUT);
                assert_eq!(frame.reason.as_str(), "logged out");
            }
            other => panic!("Expected close frame, got {:?}", other),
        }
        assert_eq!(h.task.await.unwrap(), CloseCause::LoggedOut);
        assert_eq!(h.bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_logout_for_someone_else_is_ignored() {
        let mut h = start(Role::Parent).await;
        h.bus.logout(h.identity.family_uid, Uuid::new_v4());
        h.bus.emit(DomainEvent::new(
            h.identity.family_uid,
            member_added(Uuid::new_v4()),
        ));

        let frame = text(h.outgoing.next().await.unwrap());
        assert_eq!(frame["type"], "FamilyMemberAdded");

        drop(h.incoming);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_ends_loop() {
        let h = start(Role::Parent).await;
        let topic = Topic::family(h.identity.family_uid);
        drop(h.outgoing);

        h.bus.emit(DomainEvent::new(
            h.identity.family_uid,
            member_added(Uuid::new_v4()),
        ));

        assert_eq!(h.task.await.unwrap(), CloseCause::WriteFailed);
        assert_eq!(h.bus.subscriber_count(&topic), 0);
        drop(h.incoming);
    }
}
