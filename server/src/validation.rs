//! Stateless checks applied to client input before it touches shared state.
//!
//! Rejections are silent towards the client; callers log them at debug level.

use shared::{ColorCode, PlayerState, SkinData};
use thiserror::Error;

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 14;
pub const MAX_CHAT_LEN: usize = 200;

/// Why a client message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("session is not registered")]
    UnknownSession,
    #[error("declared id does not match controller id")]
    ChannelMismatch,
    #[error("player name length outside 3..=14")]
    NameLength,
    #[error("non-finite coordinates")]
    NonFinite,
    #[error("flag index out of range")]
    FlagOutOfRange,
    #[error("liveness lease expired")]
    LeaseExpired,
    #[error("no accepted player state yet")]
    NoPlayerState,
    #[error("malformed skin")]
    InvalidSkin,
    #[error("flag is not held by the target")]
    NotHolder,
    #[error("flag is already held")]
    AlreadyHeld,
    #[error("too far from flag")]
    TooFar,
    #[error("chat cooldown active")]
    Cooldown,
    #[error("empty chat message")]
    EmptyChat,
}

/// Anti-spoofing and name checks for a player state update.
pub fn validate_player_state(state: &PlayerState) -> Result<(), Rejection> {
    if state.channel_id != state.controller.channel_id {
        return Err(Rejection::ChannelMismatch);
    }

    let name_len = state.player_name.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name_len) {
        return Err(Rejection::NameLength);
    }

    let stick = [state.controller.stick_x, state.controller.stick_y];
    if !state
        .pos
        .iter()
        .chain(&state.angle)
        .chain(&stick)
        .all(|c| c.is_finite())
    {
        return Err(Rejection::NonFinite);
    }

    Ok(())
}

/// All seven channels must be valid or the whole skin is rejected.
pub fn validate_skin(skin: &SkinData) -> Result<(), Rejection> {
    if skin.channels().into_iter().all(is_valid_color) {
        Ok(())
    } else {
        Err(Rejection::InvalidSkin)
    }
}

/// A channel is the random sentinel, a 6 digit hex code, or six integer
/// components in `0..=255`.
pub fn is_valid_color(color: &ColorCode) -> bool {
    match color {
        ColorCode::Code(_) if color.is_random() => true,
        ColorCode::Code(code) => {
            code.chars().count() == 6 && code.chars().all(|c| c.is_ascii_hexdigit())
        }
        ColorCode::Components(components) => {
            components.len() == 6
                && components
                    .iter()
                    .all(|&c| c.fract() == 0.0 && (0.0..=255.0).contains(&c))
        }
    }
}

/// Truncates to [`MAX_CHAT_LEN`] characters and strips angle brackets.
pub fn sanitize_chat(message: &str) -> String {
    message
        .chars()
        .take(MAX_CHAT_LEN)
        .filter(|&c| c != '<' && c != '>')
        .collect()
}

/// Bounds-checks a client supplied flag index.
pub fn flag_index(flag_id: u32, flag_count: usize) -> Result<usize, Rejection> {
    let index = flag_id as usize;
    if index < flag_count {
        Ok(index)
    } else {
        Err(Rejection::FlagOutOfRange)
    }
}
