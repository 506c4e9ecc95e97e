//! Session registry for connected clients
//!
//! This module owns every live session and is the only place sessions are
//! created or destroyed:
//! - Session id allocation from a wrapping counter that skips live ids
//! - Generation tagging so stale events for a recycled id are ignored
//! - Per-session state slots (liveness lease, player state, skin, chat cooldown)
//! - Outbound queues used for unicast and broadcast delivery
//!
//! Other components refer to sessions by [`SessionId`] or [`SessionHandle`]
//! and must treat a failed lookup as a no-op.

use log::info;
use shared::{ControllerState, PlayerState, SkinData};
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

pub type SessionId = u32;

/// Highest id handed out before the counter wraps back to zero.
pub const DEFAULT_ID_CEILING: SessionId = 1_000_000;

/// Primary ticks a session stays live after an accepted player update.
pub const LIVENESS_TICKS: u32 = 100;

/// Seconds between two accepted chat messages of one session.
pub const CHAT_COOLDOWN_SECS: u32 = 3;

/// Frames a connection may have queued before it counts as backlogged.
///
/// Roughly four seconds of snapshots at the default frame rate.
pub const OUTBOUND_QUEUE_FRAMES: usize = 128;

/// Identifies one incarnation of a session.
///
/// Ids are recycled after the counter wraps; generations never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: SessionId,
    pub generation: u64,
}

/// Registry side of a connection's outbound path.
#[derive(Debug)]
pub struct OutboundSender {
    frames: mpsc::Sender<Vec<u8>>,
    close: Option<oneshot::Sender<()>>,
}

/// Connection side of the outbound path, drained by the writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    pub frames: mpsc::Receiver<Vec<u8>>,
    /// Resolves with `Ok` when the server asks for the socket to be closed,
    /// with `Err` once the session is gone without asking.
    pub close: oneshot::Receiver<()>,
}

/// Creates a bounded frame queue plus a close signal that bypasses it.
pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (frames_tx, frames_rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = oneshot::channel();
    (
        OutboundSender {
            frames: frames_tx,
            close: Some(close_tx),
        },
        OutboundReceiver {
            frames: frames_rx,
            close: close_rx,
        },
    )
}

/// A skin plus whether it still needs to go out in the next cosmetic broadcast.
#[derive(Debug, Clone)]
pub struct Skin {
    pub data: SkinData,
    pub updated: bool,
}

/// Server-side record for one connected client
#[derive(Debug)]
pub struct Session {
    pub handle: SessionHandle,
    /// Liveness lease in primary ticks
    pub validity: u32,
    /// Latest accepted player state, id already forced to `handle.id`
    pub player_state: Option<PlayerState>,
    /// Latest raw controller input
    pub last_controller: Option<ControllerState>,
    pub skin: Option<Skin>,
    /// Seconds until another chat message is accepted
    pub chat_cooldown: u32,
    /// Primary ticks spent without ever sending an accepted player state
    pub ticks_without_state: u32,
    /// Set once a frame was refused because the outbound queue was full
    pub backlogged: bool,
    outbound: OutboundSender,
}

impl Session {
    fn new(handle: SessionHandle, outbound: OutboundSender) -> Self {
        Self {
            handle,
            validity: 0,
            player_state: None,
            last_controller: None,
            skin: None,
            chat_cooldown: 0,
            ticks_without_state: 0,
            backlogged: false,
            outbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Queues a binary frame without waiting.
    ///
    /// Returns false if the frame was dropped, either because the connection
    /// is already gone or because its queue is full. A full queue also marks
    /// the session as [`backlogged`](Session::backlogged).
    pub fn send(&mut self, frame: Vec<u8>) -> bool {
        match self.outbound.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.backlogged = true;
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the writer task to close the socket, skipping any queued frames.
    pub fn close(&mut self) {
        if let Some(close) = self.outbound.close.take() {
            let _ = close.send(());
        }
    }

    /// Accepts a validated player state and renews the liveness lease.
    pub fn accept_player_state(&mut self, mut state: PlayerState) {
        state.channel_id = self.handle.id;
        self.last_controller = Some(state.controller.clone());
        self.player_state = Some(state);
        self.validity = LIVENESS_TICKS;
    }

    /// Last known position, if the session ever sent a player state.
    pub fn position(&self) -> Option<[f32; 3]> {
        self.player_state.as_ref().map(|state| state.pos)
    }

    /// True while the liveness lease is running.
    pub fn has_fresh_state(&self) -> bool {
        self.validity > 0
    }
}

/// Owns all live sessions
pub struct ClientManager {
    sessions: HashMap<SessionId, Session>,
    /// Last id handed out
    last_id: SessionId,
    next_generation: u64,
    id_ceiling: SessionId,
}

impl ClientManager {
    /// Creates an empty registry whose ids range over `0..=id_ceiling`.
    pub fn new(id_ceiling: SessionId) -> Self {
        Self {
            sessions: HashMap::new(),
            last_id: 0,
            next_generation: 0,
            id_ceiling,
        }
    }

    /// Registers a new session and returns its handle.
    ///
    /// Returns None only when every id up to the ceiling is in use.
    pub fn open(&mut self, outbound: OutboundSender) -> Option<SessionHandle> {
        let id = self.allocate_id()?;
        let handle = SessionHandle {
            id,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        self.sessions.insert(id, Session::new(handle, outbound));
        info!("Session {} opened ({} live)", id, self.sessions.len());
        Some(handle)
    }

    fn allocate_id(&mut self) -> Option<SessionId> {
        if self.sessions.len() > self.id_ceiling as usize {
            return None;
        }

        loop {
            self.last_id = if self.last_id >= self.id_ceiling {
                0
            } else {
                self.last_id + 1
            };
            if !self.sessions.contains_key(&self.last_id) {
                return Some(self.last_id);
            }
        }
    }

    /// Removes the session if `handle` still names its current incarnation.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        if !self.is_live(handle) {
            return None;
        }
        let session = self.sessions.remove(&handle.id)?;
        info!("Session {} closed ({} live)", handle.id, self.sessions.len());
        Some(session)
    }

    /// Returns true if `handle` names the current incarnation of its id.
    pub fn is_live(&self, handle: SessionHandle) -> bool {
        self.sessions
            .get(&handle.id)
            .is_some_and(|session| session.handle == handle)
    }

    /// Looks up a session by bare id.
    ///
    /// Use this for ids that came from the current incarnation, such as the
    /// sender of a message being processed right now. Anything that may have
    /// outlived its session should go through [`get_live`](Self::get_live).
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Mutable counterpart of [`get`](Self::get).
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Looks up a session by handle, ignoring older incarnations of the id.
    pub fn get_live(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions
            .get(&handle.id)
            .filter(|session| session.handle == handle)
    }

    /// Mutable counterpart of [`get_live`](Self::get_live).
    pub fn get_live_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions
            .get_mut(&handle.id)
            .filter(|session| session.handle == handle)
    }

    /// Iterates sessions in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Iterates sessions mutably in unspecified order.
    ///
    /// Used by the periodic jobs to count down leases and cooldowns.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Queues the same frame for every session.
    ///
    /// Sessions whose queue is full miss this frame and are marked
    /// backlogged; see [`backlogged`](Self::backlogged).
    pub fn broadcast(&mut self, frame: &[u8]) {
        for session in self.sessions.values_mut() {
            session.send(frame.to_vec());
        }
    }

    /// Handles of sessions that could not keep up with their outbound queue.
    pub fn backlogged(&self) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .filter(|session| session.backlogged)
            .map(|session| session.handle)
            .collect()
    }

    /// Returns the number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new(DEFAULT_ID_CEILING)
    }
}
