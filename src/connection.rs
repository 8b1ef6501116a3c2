use crate::error::DuetError;
use crate::matchmaker::{ConnHandle, PairOutcome};
use crate::metrics::{counters, gauges, histograms};
use crate::protocol::{ClientMessage, ErrorReason, ServerMessage};
use crate::ratelimit::RateLimiter;
use crate::server::ServerState;
use crate::verify::VerifyOutcome;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Serialize and send one server message on the socket.
async fn send_msg(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), DuetError> {
    let json = serde_json::to_string(msg)?;
    ws_tx
        .send(Message::Text(json))
        .await
        .map_err(DuetError::WebSocket)
}

/// Push a server event into a peer's delivery channel. Best effort: a full
/// or closed channel drops the event rather than blocking the sender.
fn push_event(target: &ConnHandle, msg: ServerMessage) {
    match target.tx.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            counters::messages_dropped_total("backpressure");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            counters::messages_dropped_total("offline");
        }
    }
}

/// Deliver the queue/match events a `pair_or_queue` outcome calls for.
/// The subject's own events also travel through its delivery channel so
/// its task observes them in order with everything else.
fn announce(state: &ServerState, subject: &ConnHandle, outcome: PairOutcome) {
    match outcome {
        PairOutcome::Queued => push_event(subject, ServerMessage::Queued),
        PairOutcome::NoOp => {}
        PairOutcome::Matched { room_id, partner } => {
            counters::matches_total();
            push_event(
                &partner,
                ServerMessage::Matched {
                    room_id: room_id.clone(),
                },
            );
            push_event(subject, ServerMessage::Matched { room_id });
        }
    }
    gauges::queue_depth(state.matchmaker.waiting_len());
    gauges::rooms_active(state.matchmaker.room_count());
}

/// Gate phase: wait for a `verify_captcha` message and consult the
/// external collaborator. Everything else arriving before verification is
/// silently dropped. Returns once verification succeeds; a rejected token
/// or an exhausted timeout is fatal for the connection.
async fn perform_verification(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    state: &ServerState,
) -> Result<(), DuetError> {
    let phase = Duration::from_secs(state.config.verify_timeout);
    timeout(phase, verification_loop(ws_tx, ws_rx, state))
        .await
        .map_err(|_| {
            counters::verifications_total("timeout");
            DuetError::VerificationTimeout
        })?
}

async fn verification_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    state: &ServerState,
) -> Result<(), DuetError> {
    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(DuetError::WebSocket(e)),
            None => return Err(DuetError::ConnectionClosed),
        };

        let token = match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::VerifyCaptcha { token }) => token,
                // Unverified traffic is dropped without surfacing anything
                Ok(_) | Err(_) => continue,
            },
            Message::Ping(data) => {
                if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                    tracing::debug!("failed to send pong: {}", e);
                }
                continue;
            }
            Message::Close(_) => return Err(DuetError::ConnectionClosed),
            _ => continue,
        };

        match state.verifier.check(&token).await {
            VerifyOutcome::Accepted => {
                counters::verifications_total("accepted");
                send_msg(ws_tx, &ServerMessage::CaptchaSuccess).await?;
                return Ok(());
            }
            VerifyOutcome::Rejected => {
                counters::verifications_total("rejected");
                let _ = send_msg(
                    ws_tx,
                    &ServerMessage::Error {
                        reason: ErrorReason::VerificationFailed,
                    },
                )
                .await;
                return Err(DuetError::VerificationFailed);
            }
            VerifyOutcome::CollaboratorError => {
                // Non-fatal: the client may retry with a fresh token
                counters::verifications_total("error");
                send_msg(
                    ws_tx,
                    &ServerMessage::Error {
                        reason: ErrorReason::ServerError,
                    },
                )
                .await?;
            }
        }
    }
}

/// Drive the select loop for a verified connection: inbound dispatch,
/// outbound delivery, and the liveness probe cycle.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<ServerMessage>,
    state: &ServerState,
    handle: &ConnHandle,
) -> Result<(), DuetError> {
    let mut rate_limiter = RateLimiter::new(Duration::from_millis(state.config.rate_window_ms));
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    // First tick fires immediately; consume it so the probe cycle starts
    // one full period from now.
    ping_interval.tick().await;
    let mut alive = true;
    // Local view of the current room. The registry is the source of truth;
    // this goes stale only in the window before an `ended`/`partner_left`
    // event is processed, which dispatch surfaces as `room_missing`.
    let mut room_id: Option<String> = None;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        dispatch(&text, state, ws_tx, &mut rate_limiter, handle, &mut room_id)
                            .await?;
                        histograms::dispatch_latency_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        alive = true;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(DuetError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(event) = deliver_rx.recv() => {
                match &event {
                    ServerMessage::Matched { room_id: rid } => room_id = Some(rid.clone()),
                    ServerMessage::Ended | ServerMessage::PartnerLeft => room_id = None,
                    _ => {}
                }
                send_msg(ws_tx, &event).await?;
            }
            _ = ping_interval.tick() => {
                if !alive {
                    tracing::debug!(conn = handle.id, "liveness probe unanswered, terminating");
                    return Ok(());
                }
                alive = false;
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// Protocol state machine for one inbound message (post-verification).
async fn dispatch(
    raw: &str,
    state: &ServerState,
    ws_tx: &mut WsSink,
    rate_limiter: &mut RateLimiter,
    handle: &ConnHandle,
    room_id: &mut Option<String>,
) -> Result<(), DuetError> {
    // Malformed input is a protocol error: drop it, keep the connection
    let Ok(msg) = serde_json::from_str::<ClientMessage>(raw) else {
        tracing::debug!(conn = handle.id, "dropping unparseable message");
        counters::messages_dropped_total("malformed");
        return Ok(());
    };

    if !rate_limiter.check_and_record(state.config.msg_rate) {
        counters::messages_dropped_total("rate_limit");
        return send_msg(
            ws_tx,
            &ServerMessage::Error {
                reason: ErrorReason::RateLimit,
            },
        )
        .await;
    }

    match msg {
        ClientMessage::VerifyCaptcha { .. } => {
            tracing::debug!(conn = handle.id, "ignoring verify_captcha after verification");
        }
        ClientMessage::FindPartner => {
            let outcome = state.matchmaker.pair_or_queue(handle);
            announce(state, handle, outcome);
        }
        ClientMessage::Next => {
            if let Some(partner) = state.matchmaker.skip(handle.id) {
                counters::rooms_ended_total("skip");
                *room_id = None;
                push_event(&partner, ServerMessage::Ended);
                // The vacated partner goes back to the queue automatically
                if partner.is_open() {
                    let outcome = state.matchmaker.pair_or_queue(&partner);
                    announce(state, &partner, outcome);
                }
            }
            let outcome = state.matchmaker.pair_or_queue(handle);
            announce(state, handle, outcome);
        }
        ClientMessage::Chat { text } => {
            let Some(rid) = room_id.as_deref() else {
                return send_msg(
                    ws_tx,
                    &ServerMessage::Error {
                        reason: ErrorReason::NotPaired,
                    },
                )
                .await;
            };
            match state.matchmaker.partner_in(rid, handle.id) {
                Some(partner) => {
                    counters::messages_relayed_total("chat");
                    push_event(&partner, ServerMessage::Chat { text });
                }
                None => {
                    // Room destroyed while this message was in flight
                    *room_id = None;
                    return send_msg(
                        ws_tx,
                        &ServerMessage::Error {
                            reason: ErrorReason::RoomMissing,
                        },
                    )
                    .await;
                }
            }
        }
        // The photo consent exchange is relayed verbatim; no consent state
        // is kept server-side. Unpaired photo traffic is dropped without
        // an error.
        ClientMessage::RequestPhoto => {
            if let Some(partner) = current_partner(state, handle, room_id) {
                counters::messages_relayed_total("photo_request");
                push_event(&partner, ServerMessage::RequestPhoto);
            }
        }
        ClientMessage::ResponsePhoto { accepted } => {
            if let Some(partner) = current_partner(state, handle, room_id) {
                counters::messages_relayed_total("photo_response");
                push_event(&partner, ServerMessage::ResponsePhoto { accepted });
            }
        }
        ClientMessage::PhotoData { image } => {
            if let Some(partner) = current_partner(state, handle, room_id) {
                counters::messages_relayed_total("photo_data");
                push_event(&partner, ServerMessage::PhotoData { image });
            }
        }
    }

    Ok(())
}

/// Resolve the partner for a relay-only message, clearing the local room
/// view if the registry no longer knows the room.
fn current_partner(
    state: &ServerState,
    handle: &ConnHandle,
    room_id: &mut Option<String>,
) -> Option<ConnHandle> {
    let rid = room_id.as_deref()?;
    let partner = state.matchmaker.partner_in(rid, handle.id);
    if partner.is_none() {
        *room_id = None;
    }
    partner
}

/// Accept, verify, register, and drive one client connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), DuetError> {
    // Bound the number of connections that have not yet passed the gate,
    // so unverified clients cannot exhaust file descriptors. The slot is
    // released as soon as verification settles; verified connections are
    // bounded by `max_conns` instead.
    let gate_permit = state.pre_verify_semaphore.acquire().await.map_err(|_| {
        tracing::debug!("pre-verify semaphore closed");
        DuetError::ConnectionClosed
    })?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let client_ip = peer_addr.ip();

    // Atomic check-and-increment for per-IP connection limiting
    let mut should_reject = false;
    match state.ip_connections.entry(client_ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            let count = *entry.get();
            if count >= state.config.max_conns_ip {
                should_reject = true;
            } else {
                *entry.get_mut() += 1;
            }
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(1);
        }
    }

    if should_reject {
        tracing::debug!(ip = %client_ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(DuetError::ConnectionClosed);
    }

    let _ip_guard = IpGuard {
        state: state.clone(),
        ip: client_ip,
    };

    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(DuetError::WebSocket)?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    perform_verification(&mut ws_tx, &mut ws_rx, &state).await?;
    drop(gate_permit);

    let (deliver_tx, mut deliver_rx) = mpsc::channel::<ServerMessage>(256);
    let handle = ConnHandle {
        id: state.next_conn_id.fetch_add(1, Ordering::Relaxed),
        tx: deliver_tx,
    };

    gauges::inc_connections_active();

    let result = run_message_loop(&mut ws_tx, &mut ws_rx, &mut deliver_rx, &state, &handle).await;

    // Disconnect cascade: leave the queue, destroy the room, and notify
    // the abandoned partner. Abandon never requeues the survivor; skip is
    // the only transition that does.
    drop(deliver_rx);
    if let Some(partner) = state.matchmaker.abandon(handle.id) {
        counters::rooms_ended_total("abandon");
        push_event(&partner, ServerMessage::PartnerLeft);
    }
    gauges::queue_depth(state.matchmaker.waiting_len());
    gauges::rooms_active(state.matchmaker.room_count());
    gauges::dec_connections_active();

    result
}
