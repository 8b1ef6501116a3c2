//! Matchmaking queue and room registry.
//!
//! Single source of truth for "who is my partner". The FIFO queue and the
//! room table live behind one mutex so the pairing step is atomic: a
//! connection is never matched twice and never sits in the queue while it
//! is a room member. All methods take `&self` and lock internally; no lock
//! is held across an `.await`.

use crate::protocol::ServerMessage;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Opaque connection identifier, assigned by the transport layer.
pub type ConnId = u64;

/// Handle held in the queue and room table — used to push server events
/// into a connection's delivery channel.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Transport-assigned identifier.
    pub id: ConnId,
    /// Delivery channel into the connection's task.
    pub tx: mpsc::Sender<ServerMessage>,
}

impl ConnHandle {
    /// Whether the connection's task is still draining its channel.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// One active pairing of exactly two connections.
#[derive(Debug)]
struct Room {
    a: ConnHandle,
    b: ConnHandle,
}

impl Room {
    fn other(&self, me: ConnId) -> Option<&ConnHandle> {
        if self.a.id == me {
            Some(&self.b)
        } else if self.b.id == me {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Result of [`Matchmaker::pair_or_queue`].
#[derive(Debug)]
pub enum PairOutcome {
    /// Queue was empty; the connection is now waiting.
    Queued,
    /// Already waiting or already in a room; nothing changed.
    NoOp,
    /// Paired with the longest-waiting live connection.
    Matched {
        /// Identifier of the freshly registered room.
        room_id: String,
        /// The other room member.
        partner: ConnHandle,
    },
}

#[derive(Default)]
struct Registry {
    waiting: VecDeque<ConnHandle>,
    rooms: HashMap<String, Room>,
    member_rooms: HashMap<ConnId, String>,
}

impl Registry {
    fn destroy_room(&mut self, room_id: &str) -> Option<Room> {
        let room = self.rooms.remove(room_id)?;
        self.member_rooms.remove(&room.a.id);
        self.member_rooms.remove(&room.b.id);
        Some(room)
    }

    fn fresh_room_id(&self) -> String {
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(12)
                .map(char::from)
                .collect();
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }
}

/// FIFO matchmaker plus room registry.
#[derive(Default)]
pub struct Matchmaker {
    inner: Mutex<Registry>,
}

impl Matchmaker {
    /// Creates an empty matchmaker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair the connection with the longest-waiting live connection, or
    /// append it to the queue. No-op when the connection is already
    /// waiting or already in a room. Stale queue heads (whose tasks have
    /// gone away) are drained in the same pass.
    pub fn pair_or_queue(&self, conn: &ConnHandle) -> PairOutcome {
        let mut reg = self.inner.lock().expect("matchmaker lock poisoned");

        if reg.member_rooms.contains_key(&conn.id)
            || reg.waiting.iter().any(|w| w.id == conn.id)
        {
            return PairOutcome::NoOp;
        }

        while let Some(partner) = reg.waiting.pop_front() {
            if !partner.is_open() {
                continue;
            }
            let room_id = reg.fresh_room_id();
            reg.member_rooms.insert(conn.id, room_id.clone());
            reg.member_rooms.insert(partner.id, room_id.clone());
            reg.rooms.insert(
                room_id.clone(),
                Room {
                    a: conn.clone(),
                    b: partner.clone(),
                },
            );
            return PairOutcome::Matched { room_id, partner };
        }

        reg.waiting.push_back(conn.clone());
        PairOutcome::Queued
    }

    /// Look up the other member of a room. `None` when the room is gone
    /// (destroyed while a message was in flight) or the caller is not a
    /// member of it.
    #[must_use]
    pub fn partner_in(&self, room_id: &str, me: ConnId) -> Option<ConnHandle> {
        let reg = self.inner.lock().expect("matchmaker lock poisoned");
        reg.rooms.get(room_id)?.other(me).cloned()
    }

    /// Skip: destroy the caller's current room, returning the vacated
    /// partner so the caller can notify and requeue them. `None` when the
    /// caller has no room.
    pub fn skip(&self, me: ConnId) -> Option<ConnHandle> {
        let mut reg = self.inner.lock().expect("matchmaker lock poisoned");
        let room_id = reg.member_rooms.get(&me)?.clone();
        let room = reg.destroy_room(&room_id)?;
        room.other(me).cloned()
    }

    /// Abandon: full disconnect cascade. Removes the connection from the
    /// queue and destroys its room, returning the abandoned partner (who
    /// is notified but, unlike [`Matchmaker::skip`], not requeued).
    pub fn abandon(&self, me: ConnId) -> Option<ConnHandle> {
        let mut reg = self.inner.lock().expect("matchmaker lock poisoned");
        reg.waiting.retain(|w| w.id != me);
        let room_id = reg.member_rooms.get(&me)?.clone();
        let room = reg.destroy_room(&room_id)?;
        room.other(me).cloned()
    }

    /// Number of connections currently waiting for a partner.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.inner
            .lock()
            .expect("matchmaker lock poisoned")
            .waiting
            .len()
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner
            .lock()
            .expect("matchmaker lock poisoned")
            .rooms
            .len()
    }

    /// Room the connection is currently a member of, if any.
    #[must_use]
    pub fn room_of(&self, conn: ConnId) -> Option<String> {
        self.inner
            .lock()
            .expect("matchmaker lock poisoned")
            .member_rooms
            .get(&conn)
            .cloned()
    }

    /// Whether the connection is sitting in the queue.
    #[must_use]
    pub fn is_waiting(&self, conn: ConnId) -> bool {
        self.inner
            .lock()
            .expect("matchmaker lock poisoned")
            .waiting
            .iter()
            .any(|w| w.id == conn)
    }
}
