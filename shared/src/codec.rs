//! Binary envelope codec.
//!
//! Frames use bincode with fixed-width little-endian integers, so the layout
//! is identical to `bincode::serialize`. Decoding additionally caps
//! allocations at [`MAX_FRAME_BYTES`] and rejects trailing bytes.

use crate::{
    AttackMsg, GameMessage, GrabMsg, PlayerState, RootMsg, SkinData, WorldSnapshot,
    MAX_FRAME_BYTES,
};
use bincode::Options;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control message is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("unknown control topic `{0}`")]
    UnknownTopic(String),
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
}

/// JSON control envelope: `{"topic": ..., "msg": ...}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JsonEnvelope {
    pub topic: String,
    pub msg: serde_json::Value,
}

/// Control topics a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Chat(String),
    Skin(SkinData),
    Ping(serde_json::Value),
}

/// Structured actions a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum GameAction {
    PlayerState(PlayerState),
    Attack(AttackMsg),
    Grab(GrabMsg),
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlMessage),
    Action(GameAction),
    Snapshot(Vec<u8>),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_BYTES)
        .reject_trailing_bytes()
}

/// Decodes the outer envelope only.
pub fn decode_root(bytes: &[u8]) -> Result<RootMsg, CodecError> {
    Ok(wire_options().deserialize(bytes)?)
}

/// Decodes a client frame down to a dispatchable message.
pub fn decode(bytes: &[u8]) -> Result<Inbound, CodecError> {
    match decode_root(bytes)? {
        RootMsg::Uncompressed(message) => match message {
            GameMessage::PlayerState(state) => Ok(Inbound::Action(GameAction::PlayerState(state))),
            GameMessage::Attack(attack) => Ok(Inbound::Action(GameAction::Attack(attack))),
            GameMessage::Grab(grab) => Ok(Inbound::Action(GameAction::Grab(grab))),
            GameMessage::List(_) => Err(CodecError::UnexpectedMessage("list")),
            GameMessage::ValidPlayers(_) => Err(CodecError::UnexpectedMessage("valid players")),
        },
        RootMsg::JsonBytes(json) => {
            let envelope = decode_json(&json)?;
            let control = match envelope.topic.as_str() {
                "chat" => ControlMessage::Chat(serde_json::from_value(envelope.msg)?),
                "skin" => ControlMessage::Skin(serde_json::from_value(envelope.msg)?),
                "ping" => ControlMessage::Ping(envelope.msg),
                _ => return Err(CodecError::UnknownTopic(envelope.topic)),
            };
            Ok(Inbound::Control(control))
        }
        RootMsg::Compressed(compressed) => Ok(Inbound::Snapshot(compressed)),
    }
}

/// Parses the JSON bytes carried by [`RootMsg::JsonBytes`].
pub fn decode_json(bytes: &[u8]) -> Result<JsonEnvelope, CodecError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(text)?)
}

/// Wraps `msg` under `topic` in a JSON control envelope.
pub fn encode_json<T: Serialize>(topic: &str, msg: &T) -> Result<Vec<u8>, CodecError> {
    let envelope = JsonEnvelope {
        topic: topic.to_string(),
        msg: serde_json::to_value(msg)?,
    };
    let json = serde_json::to_vec(&envelope)?;
    Ok(wire_options().serialize(&RootMsg::JsonBytes(json))?)
}

/// Wraps a structured message in the uncompressed envelope.
pub fn encode_action(message: &GameMessage) -> Result<Vec<u8>, CodecError> {
    let root = RootMsg::Uncompressed(message.clone());
    Ok(wire_options().serialize(&root)?)
}

/// Serializes, compresses and wraps a world snapshot.
pub fn encode_snapshot(snapshot: WorldSnapshot) -> Result<Vec<u8>, CodecError> {
    let raw = wire_options().serialize(&GameMessage::List(snapshot))?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    Ok(wire_options().serialize(&RootMsg::Compressed(compressed))?)
}

/// Inflates the payload of [`RootMsg::Compressed`] back into a snapshot.
pub fn decode_snapshot(compressed: &[u8]) -> Result<WorldSnapshot, CodecError> {
    let mut raw = Vec::new();
    ZlibDecoder::new(compressed)
        .take(MAX_FRAME_BYTES)
        .read_to_end(&mut raw)?;

    let message: GameMessage = wire_options().deserialize(&raw)?;
    match message {
        GameMessage::List(snapshot) => Ok(snapshot),
        _ => Err(CodecError::UnexpectedMessage("non-list compressed")),
    }
}
