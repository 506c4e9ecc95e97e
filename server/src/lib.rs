//! # Flag Game Server Library
//!
//! This library provides the authoritative server for a realtime multiplayer
//! flag game. Clients stream their own player state over WebSocket; the server
//! decides who holds which flag, relays chat through an external profanity
//! filter and broadcasts the shared world to everyone on a fixed cadence.
//!
//! ## Core Responsibilities
//!
//! ### Session Management
//! Handles the complete lifecycle of client connections including:
//! - Id assignment from a wrapping counter that never reuses a live id
//! - A liveness lease renewed by every accepted player update
//! - Reaping sessions whose lease ran out and releasing their flags
//!
//! ### Flag Authority
//! Flags are picked up, knocked loose, fall and respawn only as the server
//! decides. Client claims (grab position, attack target) are checked against
//! server state before anything changes.
//!
//! ### Input Validation
//! Every client message passes stateless checks before it touches shared
//! state: id spoofing, name length, skin color codes, chat markup and
//! length. Rejected messages are dropped silently and logged at debug level.
//!
//! ### Broadcasting
//! Four periodic jobs run on the same actor:
//! - **Frame** (33 ms): flag physics, lease countdown, compressed world snapshot
//! - **Secondary** (66 ms): reserved slot
//! - **Roster** (1 s): ids with a live lease, chat cooldown countdown
//! - **Cosmetic** (10 s): skins changed since the previous cosmetic tick
//!
//! ## Architecture Design
//!
//! ### Single Actor
//! The [`world::World`] is owned by one task and never shared behind a lock.
//! Socket tasks and moderation tasks send it [`network::ServerMessage`]s, so
//! every state change is applied in one place and in arrival order.
//!
//! ### Generation Handles
//! Sessions are addressed by [`client_manager::SessionHandle`], an id plus a
//! generation that is never reused. Late events for a session that has
//! already gone (a moderation result, a duplicate close) are ignored even if
//! its id has been handed out again.
//!
//! ## Module Organization
//!
//! - `client_manager`: session registry and outbound queues
//! - `config`: tunables with defaults
//! - `game`: flag state machine
//! - `moderation`: external text filter and chat jobs
//! - `network`: WebSocket transport and tick scheduler
//! - `validation`: stateless input checks
//! - `world`: lifecycle handlers and periodic jobs
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::moderation::PurgoMalum;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let filter = PurgoMalum::new(config.moderation_url.clone(), config.moderation_timeout)?;
//!
//!     let server = Server::bind(config, filter).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod game;
pub mod moderation;
pub mod network;
pub mod validation;
pub mod world;
