//! Authoritative world: session lifecycle handlers and periodic jobs.
//!
//! Every method here runs to completion without suspending, so one call never
//! observes another half-applied. The only asynchronous step, chat moderation,
//! leaves this module as a [`ChatJob`] and comes back through
//! [`World::finish_chat`], which re-checks the session handle first.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use shared::{
    encode_action, encode_json, encode_snapshot, AttackMsg, ChatMsg, CodecError, ControlMessage,
    GameAction, GameMessage, GrabMsg, IdMsg, Inbound, PlayerState, SkinData, SkinMsg,
    WorldSnapshot,
};

use crate::client_manager::{
    ClientManager, OutboundSender, SessionHandle, SessionId, Skin, CHAT_COOLDOWN_SECS,
    DEFAULT_ID_CEILING,
};
use crate::game::FlagGame;
use crate::moderation::{ChatJob, ChatOutcome};
use crate::validation::{sanitize_chat, validate_player_state, validate_skin, Rejection};

/// Tunables that affect world semantics rather than transport.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub id_ceiling: SessionId,
    /// Reap sessions that never send a valid player state after this many
    /// primary ticks. None keeps them until the socket closes.
    pub handshake_ticks: Option<u32>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            id_ceiling: DEFAULT_ID_CEILING,
            handshake_ticks: None,
        }
    }
}

/// Counters reported by the stats log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub num_players: usize,
    /// Size in bytes of the last broadcast snapshot frame
    pub last_snapshot_size: usize,
    pub ticks: u64,
}

pub struct World {
    clients: ClientManager,
    flags: FlagGame,
    config: WorldConfig,
    rng: StdRng,
    stats: Stats,
}

impl World {
    /// Creates an empty world with an entropy-seeded RNG for attack scatter.
    pub fn new(config: WorldConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Same as [`World::new`] but with a caller-supplied RNG, so tests can
    /// pin where attacked flags land.
    pub fn with_rng(config: WorldConfig, rng: StdRng) -> Self {
        Self {
            clients: ClientManager::new(config.id_ceiling),
            flags: FlagGame::new(),
            config,
            rng,
            stats: Stats::default(),
        }
    }

    /// Read access to the session registry.
    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    /// Read access to the four flags, e.g. for inspecting phases in tests.
    pub fn flags(&self) -> &FlagGame {
        &self.flags
    }

    /// Current counters, with `num_players` taken from the registry.
    pub fn stats(&self) -> Stats {
        Stats {
            num_players: self.clients.len(),
            ..self.stats
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle handlers
    // ------------------------------------------------------------------

    /// Registers a new connection, tells it its id and sends it every known skin.
    pub fn on_open(&mut self, outbound: OutboundSender) -> Option<SessionHandle> {
        let Some(handle) = self.clients.open(outbound) else {
            warn!("Refusing connection: every session id is in use");
            return None;
        };

        let mut frames = Vec::new();
        match encode_json("id", &IdMsg { id: handle.id }) {
            Ok(frame) => frames.push(frame),
            Err(e) => error_encoding("id", &e),
        }
        for session in self.clients.iter() {
            if session.handle == handle {
                continue;
            }
            if let Some(skin) = &session.skin {
                match skin_frame(session.id(), &skin.data) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => error_encoding("skin", &e),
                }
            }
        }

        if let Some(session) = self.clients.get_live_mut(handle) {
            for frame in frames {
                session.send(frame);
            }
        }
        Some(handle)
    }

    /// Decodes and dispatches one client frame.
    ///
    /// Returns a chat job when the frame was a chat message that passed the
    /// local checks and now needs the external filter.
    pub fn on_message(&mut self, handle: SessionHandle, frame: &[u8]) -> Option<ChatJob> {
        if !self.clients.is_live(handle) {
            return None;
        }

        let inbound = match shared::decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping frame from session {}: {}", handle.id, e);
                return None;
            }
        };

        let result = match inbound {
            Inbound::Action(GameAction::PlayerState(state)) => {
                self.process_player_state(handle.id, state)
            }
            Inbound::Action(GameAction::Attack(attack)) => self.process_attack(handle.id, attack),
            Inbound::Action(GameAction::Grab(grab)) => self.process_grab(handle.id, grab),
            Inbound::Control(ControlMessage::Skin(skin)) => self.process_skin(handle.id, skin),
            Inbound::Control(ControlMessage::Ping(_)) => {
                if let Some(session) = self.clients.get_mut(handle.id) {
                    session.send(frame.to_vec());
                }
                Ok(())
            }
            Inbound::Control(ControlMessage::Chat(message)) => {
                return match self.process_chat(handle, &message) {
                    Ok(job) => Some(job),
                    Err(rejection) => {
                        debug!("Chat from session {} dropped: {}", handle.id, rejection);
                        None
                    }
                };
            }
            Inbound::Snapshot(_) => {
                warn!(
                    "Dropping frame from session {}: compressed snapshot from client",
                    handle.id
                );
                Ok(())
            }
        };

        if let Err(rejection) = result {
            debug!("Message from session {} rejected: {}", handle.id, rejection);
        }
        None
    }

    /// Releases any flag the session held and forgets it.
    pub fn on_close(&mut self, handle: SessionHandle) {
        if !self.clients.is_live(handle) {
            return;
        }
        let last_position = self
            .clients
            .get_live(handle)
            .and_then(|session| session.position());
        self.flags.release_held_by(handle.id, last_position);
        self.clients.remove(handle);
    }

    /// Applies a moderation result if the session is still the one that asked.
    pub fn finish_chat(&mut self, outcome: ChatOutcome) {
        let ChatOutcome { job, result } = outcome;
        if !self.clients.is_live(job.handle) {
            debug!("Discarding moderation result for closed session {}", job.handle.id);
            return;
        }

        let filtered = match result {
            Ok(filtered) => filtered,
            Err(e) => {
                warn!("Chat from session {} dropped: {}", job.handle.id, e);
                return;
            }
        };

        if filtered.player_name != job.player_name {
            warn!(
                "Session {} failed the name filter, disconnecting",
                job.handle.id
            );
            self.disconnect(job.handle);
            return;
        }

        let chat = ChatMsg {
            channel_id: job.handle.id,
            msg: sanitize_chat(&filtered.message),
            sender: job.player_name,
        };
        self.broadcast_json("chat", &chat);
    }

    /// Full cleanup plus a close request to the transport.
    fn disconnect(&mut self, handle: SessionHandle) {
        if let Some(session) = self.clients.get_live_mut(handle) {
            session.close();
        }
        self.on_close(handle);
    }

    // ------------------------------------------------------------------
    // Message processing
    // ------------------------------------------------------------------

    fn process_player_state(
        &mut self,
        sender: SessionId,
        state: PlayerState,
    ) -> Result<(), Rejection> {
        validate_player_state(&state)?;
        let session = self
            .clients
            .get_mut(sender)
            .ok_or(Rejection::UnknownSession)?;
        session.accept_player_state(state);
        Ok(())
    }

    fn process_attack(&mut self, attacker: SessionId, attack: AttackMsg) -> Result<(), Rejection> {
        let session = self
            .clients
            .get(attacker)
            .ok_or(Rejection::UnknownSession)?;
        if !session.has_fresh_state() {
            return Err(Rejection::LeaseExpired);
        }
        let attacker_pos = session.position().ok_or(Rejection::NoPlayerState)?;

        if attack.attacker_id != attacker {
            debug!(
                "Session {} declared attacker {}, using socket id",
                attacker, attack.attacker_id
            );
        }
        self.flags.attack(
            attacker,
            attacker_pos,
            attack.flag_id,
            attack.target_id,
            &mut self.rng,
        )
    }

    fn process_grab(&mut self, grabber: SessionId, grab: GrabMsg) -> Result<(), Rejection> {
        if self.clients.get(grabber).is_none() {
            return Err(Rejection::UnknownSession);
        }
        self.flags.grab(grabber, &grab)
    }

    fn process_skin(&mut self, sender: SessionId, skin: SkinData) -> Result<(), Rejection> {
        let session = self
            .clients
            .get_mut(sender)
            .ok_or(Rejection::UnknownSession)?;
        if !session.has_fresh_state() {
            return Err(Rejection::LeaseExpired);
        }
        validate_skin(&skin)?;
        session.skin = Some(Skin {
            data: skin,
            updated: true,
        });
        Ok(())
    }

    fn process_chat(&mut self, handle: SessionHandle, message: &str) -> Result<ChatJob, Rejection> {
        let session = self
            .clients
            .get_live_mut(handle)
            .ok_or(Rejection::UnknownSession)?;

        if session.chat_cooldown > 0 {
            return Err(Rejection::Cooldown);
        }
        // Armed before any further check so retries cannot skip it.
        session.chat_cooldown = CHAT_COOLDOWN_SECS;

        if message.is_empty() {
            return Err(Rejection::EmptyChat);
        }
        let player_name = session
            .player_state
            .as_ref()
            .map(|state| state.player_name.clone())
            .ok_or(Rejection::NoPlayerState)?;

        Ok(ChatJob {
            handle,
            message: sanitize_chat(message),
            player_name,
        })
    }

    // ------------------------------------------------------------------
    // Periodic jobs
    // ------------------------------------------------------------------

    /// Frame tick: flag physics, lease bookkeeping, snapshot broadcast.
    ///
    /// Sessions whose outbound queue overflowed are disconnected afterwards.
    pub fn primary_tick(&mut self) {
        self.stats.ticks += 1;
        self.flags.tick();

        let mut expired = Vec::new();
        for session in self.clients.iter_mut() {
            if session.validity > 0 {
                session.validity -= 1;
            } else if session.player_state.is_some() {
                expired.push(session.handle);
            } else {
                session.ticks_without_state = session.ticks_without_state.saturating_add(1);
                if self
                    .config
                    .handshake_ticks
                    .is_some_and(|limit| session.ticks_without_state > limit)
                {
                    expired.push(session.handle);
                }
            }
        }
        for handle in expired {
            info!("Session {} lease expired", handle.id);
            self.disconnect(handle);
        }

        let snapshot = WorldSnapshot {
            players: self
                .clients
                .iter()
                .filter_map(|session| session.player_state.clone())
                .collect(),
            flags: self.flags.snapshot(),
        };
        match encode_snapshot(snapshot) {
            Ok(frame) => {
                self.stats.last_snapshot_size = frame.len();
                self.clients.broadcast(&frame);
            }
            Err(e) => error_encoding("snapshot", &e),
        }

        for handle in self.clients.backlogged() {
            warn!("Session {} is not reading its frames, disconnecting", handle.id);
            self.disconnect(handle);
        }
    }

    /// Lower-rate broadcast slot. Nothing is sent on it yet.
    pub fn secondary_tick(&mut self) {}

    /// Roster of sessions with a live lease, plus chat cooldown countdown.
    pub fn roster_tick(&mut self) {
        let valid: Vec<u32> = self
            .clients
            .iter()
            .filter(|session| session.has_fresh_state())
            .map(|session| session.id())
            .collect();
        match encode_action(&GameMessage::ValidPlayers(valid)) {
            Ok(frame) => self.clients.broadcast(&frame),
            Err(e) => error_encoding("roster", &e),
        }

        for session in self.clients.iter_mut() {
            session.chat_cooldown = session.chat_cooldown.saturating_sub(1);
        }
    }

    /// Broadcasts skins that changed since the last cosmetic tick.
    pub fn cosmetic_tick(&mut self) {
        let mut frames = Vec::new();
        for session in self.clients.iter_mut() {
            let id = session.id();
            let Some(skin) = session.skin.as_mut().filter(|skin| skin.updated) else {
                continue;
            };
            skin.updated = false;
            match skin_frame(id, &skin.data) {
                Ok(frame) => frames.push(frame),
                Err(e) => error_encoding("skin", &e),
            }
        }
        for frame in frames {
            self.clients.broadcast(&frame);
        }
    }

    fn broadcast_json<T: Serialize>(&mut self, topic: &str, msg: &T) {
        match encode_json(topic, msg) {
            Ok(frame) => self.clients.broadcast(&frame),
            Err(e) => error_encoding(topic, &e),
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(WorldConfig::default())
    }
}

fn skin_frame(channel_id: SessionId, skin: &SkinData) -> Result<Vec<u8>, CodecError> {
    encode_json(
        "skin",
        &SkinMsg {
            channel_id,
            skin_data: skin.clone(),
        },
    )
}

fn error_encoding(what: &str, e: &CodecError) {
    log::error!("Failed to encode {} message: {}", what, e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::{
        outbound_channel, OutboundReceiver, LIVENESS_TICKS, OUTBOUND_QUEUE_FRAMES,
    };
    use crate::game::{FlagPhase, FLAG_STARTS};
    use crate::moderation::{FilteredChat, ModerationError};
    use shared::{decode_root, decode_snapshot, ColorCode, ControllerState, FlagState, RootMsg};

    struct Client {
        handle: SessionHandle,
        rx: OutboundReceiver,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Vec<u8>> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.frames.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn drain_roots(&mut self) -> Vec<RootMsg> {
            self.drain()
                .iter()
                .map(|bytes| decode_root(bytes).unwrap())
                .collect()
        }

        fn close_requested(&mut self) -> bool {
            matches!(self.rx.close.try_recv(), Ok(()))
        }

        fn drain_json(&mut self, topic: &str) -> Vec<serde_json::Value> {
            self.drain_roots()
                .into_iter()
                .filter_map(|root| match root {
                    RootMsg::JsonBytes(json) => {
                        let envelope = shared::decode_json(&json).unwrap();
                        (envelope.topic == topic).then_some(envelope.msg)
                    }
                    _ => None,
                })
                .collect()
        }

        fn last_snapshot(&mut self) -> Option<WorldSnapshot> {
            self.drain_roots()
                .into_iter()
                .filter_map(|root| match root {
                    RootMsg::Compressed(bytes) => Some(decode_snapshot(&bytes).unwrap()),
                    _ => None,
                })
                .last()
        }
    }

    fn world() -> World {
        World::with_rng(WorldConfig::default(), StdRng::seed_from_u64(42))
    }

    fn connect(world: &mut World) -> Client {
        connect_with_capacity(world, OUTBOUND_QUEUE_FRAMES)
    }

    fn connect_with_capacity(world: &mut World, capacity: usize) -> Client {
        let (tx, rx) = outbound_channel(capacity);
        let handle = world.on_open(tx).unwrap();
        Client { handle, rx }
    }

    fn player_state(id: u32, name: &str, pos: [f32; 3]) -> PlayerState {
        PlayerState {
            channel_id: id,
            controller: ControllerState {
                channel_id: id,
                ..Default::default()
            },
            pos,
            player_name: name.to_string(),
            ..Default::default()
        }
    }

    fn send_state(world: &mut World, client: &Client, name: &str, pos: [f32; 3]) {
        let frame = encode_action(&GameMessage::PlayerState(player_state(
            client.handle.id,
            name,
            pos,
        )))
        .unwrap();
        assert!(world.on_message(client.handle, &frame).is_none());
    }

    fn send_grab(world: &mut World, client: &Client, flag_id: u32, pos: [f32; 3]) {
        let frame = encode_action(&GameMessage::Grab(GrabMsg { flag_id, pos })).unwrap();
        world.on_message(client.handle, &frame);
    }

    fn send_attack(world: &mut World, client: &Client, flag_id: u32, target_id: u32) {
        let frame = encode_action(&GameMessage::Attack(AttackMsg {
            flag_id,
            attacker_id: client.handle.id,
            target_id,
        }))
        .unwrap();
        world.on_message(client.handle, &frame);
    }

    fn send_chat(world: &mut World, client: &Client, text: &str) -> Option<ChatJob> {
        let frame = encode_json("chat", &text).unwrap();
        world.on_message(client.handle, &frame)
    }

    fn scenario_skin() -> serde_json::Value {
        serde_json::json!({
            "overalls": "ff00ff", "hat": "000000", "shirt": "ffffff",
            "gloves": "r", "boots": "112233", "skin": "r", "hair": "r"
        })
    }

    fn passthrough(job: ChatJob) -> ChatOutcome {
        let result = Ok(FilteredChat {
            message: job.message.clone(),
            player_name: job.player_name.clone(),
        });
        ChatOutcome { job, result }
    }

    #[test]
    fn test_open_sends_id() {
        let mut world = world();
        let mut client = connect(&mut world);

        let ids = client.drain_json("id");
        assert_eq!(ids, vec![serde_json::json!({ "id": client.handle.id })]);
        assert_eq!(world.stats().num_players, 1);
    }

    #[test]
    fn test_open_sends_existing_skins() {
        let mut world = world();
        let a = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);
        let frame = encode_json("skin", &scenario_skin()).unwrap();
        world.on_message(a.handle, &frame);

        let mut b = connect(&mut world);
        let skins = b.drain_json("skin");
        assert_eq!(skins.len(), 1);
        assert_eq!(skins[0]["channel_id"], a.handle.id);
        assert_eq!(skins[0]["skinData"]["boots"], "112233");
    }

    #[test]
    fn test_player_state_is_forced_to_socket_id() {
        let mut world = world();
        let a = connect(&mut world);
        let _b = connect(&mut world);

        // Declares b's id consistently in both places; still lands on a.
        let spoofed = player_state(a.handle.id + 1, "Mario", [1.0, 2.0, 3.0]);
        let frame = encode_action(&GameMessage::PlayerState(spoofed)).unwrap();
        world.on_message(a.handle, &frame);

        let session = world.clients().get(a.handle.id).unwrap();
        assert_eq!(session.player_state.as_ref().unwrap().channel_id, a.handle.id);
        assert_eq!(session.validity, LIVENESS_TICKS);
        assert!(world.clients().get(a.handle.id + 1).unwrap().player_state.is_none());
    }

    #[test]
    fn test_invalid_player_state_is_dropped() {
        let mut world = world();
        let a = connect(&mut world);

        let mut state = player_state(a.handle.id, "Mario", [0.0; 3]);
        state.controller.channel_id += 1;
        let frame = encode_action(&GameMessage::PlayerState(state)).unwrap();
        world.on_message(a.handle, &frame);

        let frame = encode_action(&GameMessage::PlayerState(player_state(
            a.handle.id,
            "Mo",
            [0.0; 3],
        )))
        .unwrap();
        world.on_message(a.handle, &frame);

        let session = world.clients().get(a.handle.id).unwrap();
        assert!(session.player_state.is_none());
        assert_eq!(session.validity, 0);
    }

    #[test]
    fn test_garbage_frame_keeps_connection() {
        let mut world = world();
        let mut a = connect(&mut world);
        a.drain();

        assert!(world.on_message(a.handle, &[0xde, 0xad, 0xbe, 0xef]).is_none());
        let frame = encode_json("teleport", &1).unwrap();
        assert!(world.on_message(a.handle, &frame).is_none());

        assert!(world.clients().is_live(a.handle));
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_ping_is_echoed_verbatim() {
        let mut world = world();
        let mut a = connect(&mut world);
        a.drain();

        let frame = encode_json("ping", &serde_json::json!({ "t": 99 })).unwrap();
        world.on_message(a.handle, &frame);

        assert_eq!(a.drain(), vec![frame]);
    }

    #[test]
    fn test_scenario_grab_then_attack() {
        let mut world = world();
        let a = connect(&mut world);
        let b = connect(&mut world);
        let start = FLAG_STARTS[0];
        send_state(&mut world, &a, "Mario", start);
        send_state(&mut world, &b, "Luigi", [1000.0, 2000.0, 3000.0]);

        send_grab(&mut world, &a, 0, [start[0] + 10.0, start[1], start[2]]);
        assert_eq!(
            world.flags().get(0).unwrap().phase(),
            FlagPhase::Held(a.handle.id)
        );

        send_attack(&mut world, &b, 0, a.handle.id);
        let flag = world.flags().get(0).unwrap();
        assert_eq!(flag.phase(), FlagPhase::Falling);
        assert_eq!(flag.position[1], 2600.0);
        assert_eq!(flag.height_before_fall, 2600.0);
        assert!((flag.position[0] - 1000.0).abs() <= 500.0);
        assert!((flag.position[2] - 3000.0).abs() <= 500.0);
    }

    #[test]
    fn test_attack_requires_fresh_attacker() {
        let mut world = world();
        let a = connect(&mut world);
        let b = connect(&mut world);
        let start = FLAG_STARTS[1];
        send_state(&mut world, &a, "Mario", start);
        send_grab(&mut world, &a, 1, start);

        // b never sent a player state.
        send_attack(&mut world, &b, 1, a.handle.id);
        assert_eq!(
            world.flags().get(1).unwrap().phase(),
            FlagPhase::Held(a.handle.id)
        );

        // Out of range flag index is a rejection, not a fault.
        send_attack(&mut world, &a, 250, a.handle.id);
        send_grab(&mut world, &a, u32::MAX, start);
    }

    #[test]
    fn test_scenario_holder_disconnects() {
        let mut world = world();
        let x = connect(&mut world);
        let start = FLAG_STARTS[2];
        send_state(&mut world, &x, "Wario", [start[0], 500.0, start[2]]);
        send_grab(&mut world, &x, 2, start);

        world.on_close(x.handle);

        let flag = world.flags().get(2).unwrap();
        assert_eq!(flag.phase(), FlagPhase::Falling);
        assert_eq!(flag.position, [start[0], 600.0, start[2]]);
        assert_eq!(flag.height_before_fall, 600.0);
        assert!(world.clients().is_empty());
    }

    #[test]
    fn test_lease_expiry_reaps_session() {
        let mut world = world();
        let mut a = connect(&mut world);
        let start = FLAG_STARTS[3];
        send_state(&mut world, &a, "Mario", start);
        send_grab(&mut world, &a, 3, start);

        for expected in (0..LIVENESS_TICKS).rev() {
            world.primary_tick();
            assert_eq!(
                world.clients().get(a.handle.id).unwrap().validity,
                expected
            );
        }
        assert!(world.clients().is_live(a.handle));

        world.primary_tick();
        assert!(!world.clients().is_live(a.handle));
        assert!(a.close_requested());
        assert_eq!(world.flags().get(3).unwrap().phase(), FlagPhase::Falling);
    }

    #[test]
    fn test_stateless_sessions_are_retained_by_default() {
        let mut world = world();
        let mut a = connect(&mut world);
        for _ in 0..500 {
            world.primary_tick();
            a.drain();
        }
        assert!(world.clients().is_live(a.handle));
    }

    #[test]
    fn test_handshake_limit_reaps_stateless_sessions() {
        let config = WorldConfig {
            handshake_ticks: Some(10),
            ..WorldConfig::default()
        };
        let mut world = World::with_rng(config, StdRng::seed_from_u64(1));
        let a = connect(&mut world);
        for _ in 0..10 {
            world.primary_tick();
        }
        assert!(world.clients().is_live(a.handle));
        world.primary_tick();
        assert!(!world.clients().is_live(a.handle));
    }

    #[test]
    fn test_stalled_reader_is_disconnected() {
        let mut world = world();
        let mut reader = connect(&mut world);
        let mut stalled = connect_with_capacity(&mut world, 4);
        send_state(&mut world, &stalled, "Mario", [0.0; 3]);

        for _ in 0..3000 {
            world.primary_tick();
            reader.drain();
        }

        assert!(!world.clients().is_live(stalled.handle));
        assert!(stalled.close_requested());
        assert!(stalled.drain().len() <= 4);
        assert!(world.clients().is_live(reader.handle));
        assert_eq!(world.clients().len(), 1);
    }

    #[test]
    fn test_backlogged_holder_drops_flag() {
        let mut world = world();
        let stalled = connect_with_capacity(&mut world, 2);
        let start = FLAG_STARTS[0];
        send_state(&mut world, &stalled, "Mario", start);
        send_grab(&mut world, &stalled, 0, start);

        // The id frame plus one snapshot fill the queue; the next one overflows.
        world.primary_tick();
        assert!(world.clients().is_live(stalled.handle));
        world.primary_tick();

        assert!(!world.clients().is_live(stalled.handle));
        assert_eq!(world.flags().get(0).unwrap().phase(), FlagPhase::Falling);
    }

    #[test]
    fn test_non_finite_state_never_reaches_flag() {
        let mut world = world();
        let a = connect(&mut world);
        let b = connect(&mut world);
        let start = FLAG_STARTS[0];
        send_state(&mut world, &a, "Mario", start);
        send_grab(&mut world, &a, 0, start);

        let frame = encode_action(&GameMessage::PlayerState(player_state(
            b.handle.id,
            "Luigi",
            [f32::NAN, 0.0, f32::INFINITY],
        )))
        .unwrap();
        world.on_message(b.handle, &frame);
        assert!(world.clients().get(b.handle.id).unwrap().player_state.is_none());

        // b has no accepted state, so the attack is refused.
        send_attack(&mut world, &b, 0, a.handle.id);
        assert_eq!(
            world.flags().get(0).unwrap().phase(),
            FlagPhase::Held(a.handle.id)
        );

        // a's non-finite update is refused too; the release uses the last good one.
        let frame = encode_action(&GameMessage::PlayerState(player_state(
            a.handle.id,
            "Mario",
            [f32::NAN; 3],
        )))
        .unwrap();
        world.on_message(a.handle, &frame);
        world.on_close(a.handle);

        let flag = world.flags().get(0).unwrap();
        assert!(flag.position.iter().all(|c| c.is_finite()));
        assert_eq!(flag.height_before_fall, start[1] + 100.0);
    }

    #[test]
    fn test_snapshot_lists_players_and_flags() {
        let mut world = world();
        let mut a = connect(&mut world);
        let mut b = connect(&mut world);
        send_state(&mut world, &a, "Mario", [1.0, 2.0, 3.0]);

        world.primary_tick();

        let snap_a = a.last_snapshot().unwrap();
        let snap_b = b.last_snapshot().unwrap();
        assert_eq!(snap_a, snap_b);
        assert_eq!(snap_a.players.len(), 1);
        assert_eq!(snap_a.players[0].channel_id, a.handle.id);
        assert_eq!(snap_a.flags.len(), FLAG_STARTS.len());
        assert!(matches!(snap_a.flags[0], FlagState::Loose { .. }));
        assert!(world.stats().last_snapshot_size > 0);
    }

    #[test]
    fn test_roster_lists_fresh_sessions() {
        let mut world = world();
        let mut a = connect(&mut world);
        let b = connect(&mut world);
        send_state(&mut world, &b, "Luigi", [0.0; 3]);
        a.drain();

        world.roster_tick();

        let rosters: Vec<Vec<u32>> = a
            .drain_roots()
            .into_iter()
            .filter_map(|root| match root {
                RootMsg::Uncompressed(GameMessage::ValidPlayers(ids)) => Some(ids),
                _ => None,
            })
            .collect();
        assert_eq!(rosters, vec![vec![b.handle.id]]);
    }

    #[test]
    fn test_scenario_skin_broadcast() {
        let mut world = world();
        let a = connect(&mut world);
        let mut b = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);

        let frame = encode_json("skin", &scenario_skin()).unwrap();
        world.on_message(a.handle, &frame);
        assert!(world.clients().get(a.handle.id).unwrap().skin.is_some());
        b.drain();

        world.cosmetic_tick();
        let skins = b.drain_json("skin");
        assert_eq!(skins.len(), 1);
        assert_eq!(skins[0]["channel_id"], a.handle.id);
        assert_eq!(skins[0]["skinData"]["overalls"], "ff00ff");

        // Only changed skins go out.
        world.cosmetic_tick();
        assert!(b.drain_json("skin").is_empty());
    }

    #[test]
    fn test_skin_is_all_or_nothing() {
        let mut world = world();
        let a = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);

        let mut skin = scenario_skin();
        skin["hair"] = serde_json::json!("12345");
        let frame = encode_json("skin", &skin).unwrap();
        world.on_message(a.handle, &frame);

        assert!(world.clients().get(a.handle.id).unwrap().skin.is_none());
    }

    #[test]
    fn test_skin_requires_fresh_state() {
        let mut world = world();
        let a = connect(&mut world);
        let frame = encode_json("skin", &scenario_skin()).unwrap();
        world.on_message(a.handle, &frame);
        assert!(world.clients().get(a.handle.id).unwrap().skin.is_none());

        let skin: SkinData = serde_json::from_value(scenario_skin()).unwrap();
        assert_eq!(skin.gloves, ColorCode::Code("r".to_string()));
    }

    #[test]
    fn test_scenario_chat_cooldown() {
        let mut world = world();
        let a = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);

        assert!(send_chat(&mut world, &a, "hi").is_some());
        assert!(send_chat(&mut world, &a, "hi").is_none());

        world.roster_tick();
        world.roster_tick();
        assert!(send_chat(&mut world, &a, "hi").is_none());
        world.roster_tick();

        let job = send_chat(&mut world, &a, "hi").unwrap();
        assert_eq!(job.message, "hi");
        assert_eq!(job.player_name, "Mario");
    }

    #[test]
    fn test_chat_is_sanitized_before_filtering() {
        let mut world = world();
        let a = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);

        let text = format!("<script>{}", "z".repeat(400));
        let job = send_chat(&mut world, &a, &text).unwrap();
        assert!(!job.message.contains('<') && !job.message.contains('>'));
        assert!(job.message.chars().count() <= 200);
    }

    #[test]
    fn test_empty_chat_still_arms_cooldown() {
        let mut world = world();
        let a = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);

        assert!(send_chat(&mut world, &a, "").is_none());
        assert_eq!(
            world.clients().get(a.handle.id).unwrap().chat_cooldown,
            CHAT_COOLDOWN_SECS
        );
    }

    #[test]
    fn test_finish_chat_broadcasts() {
        let mut world = world();
        let a = connect(&mut world);
        let mut b = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);
        let job = send_chat(&mut world, &a, "hello").unwrap();
        b.drain();

        world.finish_chat(passthrough(job));

        let chats = b.drain_json("chat");
        assert_eq!(
            chats,
            vec![serde_json::json!({
                "channel_id": a.handle.id,
                "msg": "hello",
                "sender": "Mario",
            })]
        );
    }

    #[test]
    fn test_finish_chat_resanitizes_filter_output() {
        let mut world = world();
        let a = connect(&mut world);
        let mut b = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);
        let job = send_chat(&mut world, &a, "hello").unwrap();
        b.drain();

        let result = Ok(FilteredChat {
            message: format!("<{}>", "q".repeat(300)),
            player_name: job.player_name.clone(),
        });
        world.finish_chat(ChatOutcome { job, result });

        let chats = b.drain_json("chat");
        let msg = chats[0]["msg"].as_str().unwrap();
        assert!(msg.chars().count() <= 200);
        assert!(!msg.contains('<') && !msg.contains('>'));
    }

    #[test]
    fn test_name_filter_mismatch_disconnects() {
        let mut world = world();
        let mut a = connect(&mut world);
        let mut b = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);
        let job = send_chat(&mut world, &a, "hello").unwrap();
        b.drain();

        let result = Ok(FilteredChat {
            message: "hello".to_string(),
            player_name: "M****".to_string(),
        });
        world.finish_chat(ChatOutcome { job, result });

        assert!(!world.clients().is_live(a.handle));
        assert!(a.close_requested());
        assert!(b.drain_json("chat").is_empty());
    }

    #[test]
    fn test_moderation_failure_drops_message() {
        let mut world = world();
        let a = connect(&mut world);
        let mut b = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);
        let job = send_chat(&mut world, &a, "hello").unwrap();
        b.drain();

        world.finish_chat(ChatOutcome {
            job,
            result: Err(ModerationError::MissingResult),
        });

        assert!(world.clients().is_live(a.handle));
        assert!(b.drain_json("chat").is_empty());
    }

    #[test]
    fn test_late_moderation_result_is_discarded() {
        let mut world = World::with_rng(
            WorldConfig {
                id_ceiling: 1,
                handshake_ticks: None,
            },
            StdRng::seed_from_u64(3),
        );
        let a = connect(&mut world);
        send_state(&mut world, &a, "Mario", [0.0; 3]);
        let job = send_chat(&mut world, &a, "hello").unwrap();
        world.on_close(a.handle);

        // The id comes back around with a new generation.
        let _zero = connect(&mut world);
        let mut recycled = connect(&mut world);
        assert_eq!(recycled.handle.id, a.handle.id);
        recycled.drain();

        let result = Ok(FilteredChat {
            message: "hello".to_string(),
            player_name: "Different".to_string(),
        });
        world.finish_chat(ChatOutcome { job, result });

        assert!(world.clients().is_live(recycled.handle));
        assert!(recycled.drain().is_empty());
    }

    #[test]
    fn test_stale_close_is_ignored() {
        let mut world = world();
        let a = connect(&mut world);
        world.on_close(a.handle);
        world.on_close(a.handle);
        assert!(world.on_message(a.handle, &[]).is_none());
        assert!(world.clients().is_empty());
    }
}
