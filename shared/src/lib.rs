//! Wire types exchanged between the flag-run server and its clients.
//!
//! Every frame on the socket is a bincode-encoded [`RootMsg`]. The root
//! envelope either carries a structured [`GameMessage`] as-is, a zlib stream
//! holding a compressed [`GameMessage::List`] snapshot, or UTF-8 JSON bytes of
//! a `{topic, msg}` control message. See [`codec`] for the encode and decode
//! entry points.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{
    decode, decode_json, decode_root, decode_snapshot, encode_action, encode_json,
    encode_snapshot, CodecError, ControlMessage, GameAction, Inbound, JsonEnvelope,
};

/// Largest frame the decoder will allocate for.
pub const MAX_FRAME_BYTES: u64 = 8 * 1024 * 1024;

/// Sentinel color code asking the client to pick a random color.
pub const RANDOM_COLOR: &str = "r";

/// Outer envelope of every frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum RootMsg {
    Uncompressed(GameMessage),
    Compressed(Vec<u8>),
    JsonBytes(Vec<u8>),
}

/// Structured game messages. The first three travel client to server, the
/// last two are only ever emitted by the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum GameMessage {
    PlayerState(PlayerState),
    Attack(AttackMsg),
    Grab(GrabMsg),
    List(WorldSnapshot),
    ValidPlayers(Vec<u32>),
}

/// Raw controller input as sampled by the client.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ControllerState {
    pub channel_id: u32,
    pub stick_x: f32,
    pub stick_y: f32,
    pub buttons: u32,
}

/// Transform and pose of one player character.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PlayerState {
    /// Owning session as declared by the client. The server overwrites it.
    pub channel_id: u32,
    pub controller: ControllerState,
    pub pos: [f32; 3],
    pub angle: [f32; 3],
    pub action: u32,
    pub anim_id: i32,
    pub anim_frame: i32,
    pub player_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AttackMsg {
    pub flag_id: u32,
    pub attacker_id: u32,
    pub target_id: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GrabMsg {
    pub flag_id: u32,
    pub pos: [f32; 3],
}

/// Per-flag entry of a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum FlagState {
    Held { holder_id: u32 },
    Loose { pos: [f32; 3], height_before_fall: f32 },
}

/// Everything a client needs to render one frame.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WorldSnapshot {
    pub players: Vec<PlayerState>,
    pub flags: Vec<FlagState>,
}

/// One cosmetic color channel.
///
/// Clients send either a 6 character hex code, the [`RANDOM_COLOR`] sentinel,
/// or six numeric components.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ColorCode {
    Code(String),
    Components(Vec<f64>),
}

impl ColorCode {
    pub fn is_random(&self) -> bool {
        matches!(self, ColorCode::Code(code) if code == RANDOM_COLOR)
    }
}

/// Cosmetic descriptor of a player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SkinData {
    pub overalls: ColorCode,
    pub hat: ColorCode,
    pub shirt: ColorCode,
    pub gloves: ColorCode,
    pub boots: ColorCode,
    pub skin: ColorCode,
    pub hair: ColorCode,
}

impl SkinData {
    /// All seven channels in a fixed order.
    pub fn channels(&self) -> [&ColorCode; 7] {
        [
            &self.overalls,
            &self.hat,
            &self.shirt,
            &self.gloves,
            &self.boots,
            &self.skin,
            &self.hair,
        ]
    }
}

/// `id` topic payload: the id assigned to the receiving client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IdMsg {
    pub id: u32,
}

/// `chat` topic payload as broadcast by the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMsg {
    pub channel_id: u32,
    pub msg: String,
    pub sender: String,
}

/// `skin` topic payload as broadcast by the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SkinMsg {
    pub channel_id: u32,
    #[serde(rename = "skinData")]
    pub skin_data: SkinData,
}
