// One presence session per accepted WebSocket.
//
// Flow:
// 1) The socket joins its own status topic (multi-device parity) and is
//    recorded in the session registry.
// 2) A writer task drains two sources into the socket: direct replies
//    (acks, denials, errors) and the bounded status queue fed by the topic
//    forwarders. Replies are never dropped; status fanout is.
// 3) The read loop serializes all inbound messages from this client and
//    drives the presence store, publishing on transitions only.
// 4) Teardown aborts the forwarders and drops the registry entry. The
//    heartbeat record stays put: the reaper is the single offline path, so
//    a user with a second live device never flaps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use bus::Subscription;
use domain::{now_epoch, Status, UserId};
use graph::FollowGraph;
use proto::{status_topic, ClientMessage, DenyReason, Envelope, ServerMessage, StatusSnapshot};

use crate::state::AppState;

/// Pending status updates per socket. Small on purpose: a client that can't
/// keep up only ever needs the latest state per observed user.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub status: Status,
    pub ts: i64,
}

/// Bounded queue of status updates awaiting the socket writer.
///
/// When full, the oldest pending update for the same user is dropped (it is
/// superseded anyway); failing that, the oldest overall. The lock is held
/// only for enqueue/dequeue, never across an await.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<StatusUpdate>>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, update: StatusUpdate) {
        {
            let mut q = self.inner.lock();
            if q.len() >= self.capacity {
                if let Some(pos) = q.iter().position(|m| m.user_id == update.user_id) {
                    q.remove(pos);
                } else {
                    q.pop_front();
                }
            }
            q.push_back(update);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<StatusUpdate> {
        self.inner.lock().pop_front()
    }

    pub async fn pop(&self) -> StatusUpdate {
        loop {
            let notified = self.notify.notified();
            if let Some(update) = self.try_pop() {
                return update;
            }
            notified.await;
        }
    }
}

/// Monotonic-ts merge at the consumer: an envelope older than the newest
/// one seen for the subject is discarded, which resolves reorderings
/// between racing publishers.
fn admit(last_ts: &mut i64, ts: i64) -> bool {
    if ts < *last_ts {
        return false;
    }
    *last_ts = ts;
    true
}

/// Forward one joined topic into the session's outbound queue. `floor_ts`
/// seeds the monotonic merge (the subscribe ack's snapshot ts), so stale
/// envelopes buffered across the join are dropped rather than shown.
fn spawn_forwarder(
    sub: Subscription,
    subject: UserId,
    floor_ts: i64,
    outbound: Arc<OutboundQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = sub.into_receiver();
        let mut last_ts = floor_ts;
        while let Some((_topic, payload)) = rx.recv().await {
            let env = match Envelope::from_bytes(&payload) {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(subject, err = %e, "undecodable envelope, skipping");
                    continue;
                }
            };
            if env.user_id != subject {
                continue;
            }
            if !admit(&mut last_ts, env.ts) {
                continue;
            }
            outbound.push(StatusUpdate {
                user_id: env.user_id,
                status: env.status,
                ts: env.ts,
            });
        }
    })
}

/// Encode and publish a transition envelope; failures are logged and
/// dropped, the KV state stays correct and the next transition reconciles.
fn publish_transition(state: &AppState, user: UserId, status: Status, ts: i64) {
    let envelope = Envelope::status_changed(user, status, ts);
    match envelope.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = state.bus.publish(&status_topic(user), &bytes) {
                tracing::error!(user, status = %status, err = %e, "failed publishing transition");
            }
        }
        Err(e) => tracing::error!(user, err = %e, "failed encoding transition envelope"),
    }
}

/// Run the session until the socket closes.
pub async fn run(socket: WebSocket, state: AppState, self_user: UserId) {
    // Join the self topic before anything else so this socket sees its own
    // transitions, including ones published by other devices.
    let self_sub = match state.bus.subscribe(&status_topic(self_user)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(user = self_user, err = %e, "failed joining self topic, dropping session");
            return;
        }
    };

    let socket_id = state.registry.register(self_user);
    tracing::info!(user = self_user, socket_id, "presence session ready");

    let (mut ws_writer, mut ws_reader) = socket.split();
    let outbound = Arc::new(OutboundQueue::new(OUTBOUND_CAPACITY));
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(32);

    // Writer task: replies take priority over status fanout.
    let outbound_for_writer = Arc::clone(&outbound);
    let writer_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                reply = reply_rx.recv() => match reply {
                    Some(m) => m,
                    None => break,
                },
                update = outbound_for_writer.pop() => ServerMessage::Status {
                    user_id: update.user_id,
                    status: update.status,
                    ts: update.ts,
                },
            };
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(err = %e, "failed encoding outbound message");
                    continue;
                }
            };
            if ws_writer.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<UserId, JoinHandle<()>> = HashMap::new();
    forwarders.insert(
        self_user,
        spawn_forwarder(self_sub, self_user, 0, Arc::clone(&outbound)),
    );

    // Read loop: inbound messages from this client are handled one at a
    // time, so its heartbeats and subscribes never race each other.
    while let Some(Ok(frame)) = ws_reader.next().await {
        match frame {
            Message::Text(text) => {
                let msg: ClientMessage = match serde_json::from_str(text.as_str()) {
                    Ok(m) => m,
                    Err(_) => {
                        send_reply(&reply_tx, protocol_error("unrecognized message")).await;
                        continue;
                    }
                };
                handle_message(msg, &state, self_user, &mut forwarders, &outbound, &reply_tx).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                send_reply(&reply_tx, protocol_error("expected a text frame")).await;
            }
        }
    }

    // Teardown: stop fanout and drop the registry entry. Deliberately no
    // heartbeat removal here; offline is announced by the reaper once the
    // window lapses, which also covers the user's other devices.
    for (_, handle) in forwarders.drain() {
        handle.abort();
    }
    writer_task.abort();
    state.registry.unregister(socket_id);
    tracing::info!(user = self_user, socket_id, "presence session closed");
}

fn protocol_error(reason: &str) -> ServerMessage {
    ServerMessage::Error {
        reason: reason.to_string(),
    }
}

async fn send_reply(reply_tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if reply_tx.send(msg).await.is_err() {
        tracing::debug!("reply dropped, writer already gone");
    }
}

async fn handle_message(
    msg: ClientMessage,
    state: &AppState,
    self_user: UserId,
    forwarders: &mut HashMap<UserId, JoinHandle<()>>,
    outbound: &Arc<OutboundQueue>,
    reply_tx: &mpsc::Sender<ServerMessage>,
) {
    match msg {
        ClientMessage::Heartbeat => {
            let now = now_epoch();
            match state.presence.record_heartbeat(self_user, now).await {
                Ok(presence::Effect::TransitionedTo(status)) => {
                    publish_transition(state, self_user, status, now);
                }
                Ok(_) => {}
                Err(e) => {
                    // Retried by the next beat; nothing to tell the client.
                    tracing::warn!(user = self_user, err = %e, "heartbeat lost the kv");
                }
            }
        }
        ClientMessage::Away | ClientMessage::Active => {
            let target = if matches!(msg, ClientMessage::Away) {
                Status::Away
            } else {
                Status::Online
            };
            let now = now_epoch();
            match state.presence.set_semantic(self_user, target, now).await {
                Ok(presence::Effect::TransitionedTo(status)) => {
                    publish_transition(state, self_user, status, now);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user = self_user, err = %e, "semantic update lost the kv");
                }
            }
        }
        ClientMessage::Subscribe { target_user_id } => {
            handle_subscribe(state, self_user, target_user_id, forwarders, outbound, reply_tx).await;
        }
        ClientMessage::Unsubscribe { target_user_id } => {
            // Idempotent; the self topic is never left while connected.
            if target_user_id != self_user {
                if let Some(handle) = forwarders.remove(&target_user_id) {
                    handle.abort();
                }
            }
        }
    }
}

async fn handle_subscribe(
    state: &AppState,
    self_user: UserId,
    target: UserId,
    forwarders: &mut HashMap<UserId, JoinHandle<()>>,
    outbound: &Arc<OutboundQueue>,
    reply_tx: &mpsc::Sender<ServerMessage>,
) {
    let now = now_epoch();

    // Self and already-joined targets: no authorization check, just a fresh
    // snapshot so the subscribe stays idempotent.
    if target == self_user || forwarders.contains_key(&target) {
        let (status, ts) = state.presence.effective_status_or_offline(target, now).await;
        send_reply(reply_tx, ack(target, status, ts)).await;
        return;
    }

    // The self entry does not count against the subscription cap.
    if forwarders.len().saturating_sub(1) >= state.cfg.max_subscriptions_per_socket {
        send_reply(reply_tx, denied(target, DenyReason::TooManySubscriptions)).await;
        return;
    }

    let allowed = match state.graph.is_mutual(self_user, target).await {
        Ok(v) => v,
        Err(e) => {
            // An unreachable graph store denies rather than guesses.
            tracing::warn!(user = self_user, target, err = %e, "graph unavailable, denying subscribe");
            false
        }
    };
    if !allowed {
        send_reply(reply_tx, denied(target, DenyReason::NotMutual)).await;
        return;
    }

    // Join before snapshotting: envelopes racing the ack are buffered by the
    // subscription and deduped against the snapshot ts, so late joiners miss
    // nothing and see nothing stale.
    let sub = match state.bus.subscribe(&status_topic(target)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(user = self_user, target, err = %e, "failed joining status topic");
            send_reply(reply_tx, protocol_error("subscribe failed")).await;
            return;
        }
    };
    let (status, ts) = state.presence.effective_status_or_offline(target, now).await;
    forwarders.insert(target, spawn_forwarder(sub, target, ts, Arc::clone(outbound)));
    send_reply(reply_tx, ack(target, status, ts)).await;
}

fn ack(target: UserId, status: Status, ts: i64) -> ServerMessage {
    ServerMessage::SubscribeAck {
        target_user_id: target,
        current: StatusSnapshot { status, ts },
    }
}

fn denied(target: UserId, reason: DenyReason) -> ServerMessage {
    ServerMessage::SubscribeDenied {
        target_user_id: target,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_the_oldest_update_for_the_same_user() {
        let q = OutboundQueue::new(3);
        q.push(StatusUpdate { user_id: 1, status: Status::Online, ts: 10 });
        q.push(StatusUpdate { user_id: 2, status: Status::Online, ts: 11 });
        q.push(StatusUpdate { user_id: 3, status: Status::Online, ts: 12 });

        // Newer state for user 1 supersedes its pending entry.
        q.push(StatusUpdate { user_id: 1, status: Status::Away, ts: 13 });

        let drained: Vec<StatusUpdate> = std::iter::from_fn(|| q.try_pop()).collect();
        let ids: Vec<UserId> = drained.iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert_eq!(drained[2].status, Status::Away);
    }

    #[test]
    fn full_queue_without_a_duplicate_drops_the_oldest_overall() {
        let q = OutboundQueue::new(2);
        q.push(StatusUpdate { user_id: 1, status: Status::Online, ts: 10 });
        q.push(StatusUpdate { user_id: 2, status: Status::Online, ts: 11 });
        q.push(StatusUpdate { user_id: 3, status: Status::Online, ts: 12 });

        let drained: Vec<StatusUpdate> = std::iter::from_fn(|| q.try_pop()).collect();
        let ids: Vec<UserId> = drained.iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn admit_discards_envelopes_older_than_the_newest_seen() {
        let mut last = 1040;
        assert!(!admit(&mut last, 1020)); // stale: published before the snapshot
        assert!(admit(&mut last, 1040)); // duplicates of the newest pass through
        assert!(admit(&mut last, 1050));
        assert!(!admit(&mut last, 1045)); // reordered behind the newest
        assert_eq!(last, 1050);
    }
}
