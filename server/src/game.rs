//! Flag game state machine
//!
//! A fixed set of flags, each in one of four phases:
//! - **AtRest**: sitting on its spawn point
//! - **Held**: carried by a session
//! - **Falling**: dropping towards the floor after being knocked loose
//! - **Idle**: loose and no longer falling, waiting to respawn
//!
//! Sessions are referenced by id only. Flags are never created or destroyed
//! after construction.

use log::{debug, info};
use rand::Rng;
use shared::{FlagState, GrabMsg};

use crate::client_manager::SessionId;
use crate::validation::{flag_index, Rejection};

/// Spawn coordinates, one flag per entry.
pub const FLAG_STARTS: [[f32; 3]; 4] = [
    [9380.0, 7657.0, -8980.0],
    [9700.0, 7677.0, -7270.0],
    [7046.0, 7670.0, -7568.0],
    [7140.0, 7657.0, -9614.0],
];

/// Grabs must be strictly closer than this on the X/Z plane.
pub const GRAB_RADIUS: f32 = 50.0;
/// Height lost per primary tick while falling.
pub const FALL_SPEED: f32 = 2.0;
/// Falling flags stop here.
pub const FALL_FLOOR: f32 = -10000.0;
/// Primary ticks a loose flag waits before returning to its spawn.
pub const IDLE_RESET_TICKS: u32 = 3000;
/// Half-width of the horizontal scatter after a successful attack.
pub const ATTACK_SCATTER: f32 = 500.0;
pub const ATTACK_LIFT: f32 = 600.0;
/// Lift applied when the holder disconnects.
pub const DROP_LIFT: f32 = 100.0;
pub const INITIAL_HEIGHT_BEFORE_FALL: f32 = 20000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagPhase {
    AtRest,
    Held(SessionId),
    Falling,
    Idle,
}

#[derive(Debug, Clone)]
pub struct Flag {
    pub position: [f32; 3],
    /// Set iff the flag is linked to a player
    pub holder: Option<SessionId>,
    pub at_start_position: bool,
    pub fall_mode: bool,
    pub idle_timer: u32,
    pub height_before_fall: f32,
    spawn: [f32; 3],
}

impl Flag {
    fn new(spawn: [f32; 3]) -> Self {
        Self {
            position: spawn,
            holder: None,
            at_start_position: true,
            fall_mode: false,
            idle_timer: 0,
            height_before_fall: INITIAL_HEIGHT_BEFORE_FALL,
            spawn,
        }
    }

    /// Where the flag respawns after idling.
    pub fn spawn(&self) -> [f32; 3] {
        self.spawn
    }

    /// True while a session holds the flag.
    pub fn is_linked(&self) -> bool {
        self.holder.is_some()
    }

    /// Collapses the holder and mode bits into one [`FlagPhase`].
    ///
    /// A held flag is always `Held`, whatever the other bits say.
    pub fn phase(&self) -> FlagPhase {
        match self.holder {
            Some(holder) => FlagPhase::Held(holder),
            None if self.at_start_position => FlagPhase::AtRest,
            None if self.fall_mode => FlagPhase::Falling,
            None => FlagPhase::Idle,
        }
    }

    /// Unlinks the flag and starts a fall from `origin`.
    ///
    /// The position is truncated to whole units; the recorded fall height is not.
    fn drop_from(&mut self, origin: [f32; 3]) {
        self.holder = None;
        self.fall_mode = true;
        self.at_start_position = false;
        self.height_before_fall = origin[1];
        self.position = origin.map(f32::trunc);
    }

    fn reset(&mut self) {
        self.position = self.spawn;
        self.fall_mode = false;
        self.at_start_position = true;
        self.idle_timer = 0;
    }

    fn to_wire(&self) -> FlagState {
        match self.holder {
            Some(holder_id) => FlagState::Held { holder_id },
            None => FlagState::Loose {
                pos: self.position,
                height_before_fall: self.height_before_fall,
            },
        }
    }
}

/// Owns every flag
#[derive(Debug, Clone)]
pub struct FlagGame {
    flags: Vec<Flag>,
}

impl FlagGame {
    pub fn new() -> Self {
        Self::with_spawns(&FLAG_STARTS)
    }

    /// One flag per spawn point, all at rest.
    pub fn with_spawns(spawns: &[[f32; 3]]) -> Self {
        Self {
            flags: spawns.iter().copied().map(Flag::new).collect(),
        }
    }

    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    /// Looks up a flag by wire index; None when out of range.
    pub fn get(&self, flag_id: u32) -> Option<&Flag> {
        self.flags.get(flag_id as usize)
    }

    /// Binds a loose flag to `grabber` if the claimed position is close enough.
    pub fn grab(&mut self, grabber: SessionId, grab: &GrabMsg) -> Result<(), Rejection> {
        let index = flag_index(grab.flag_id, self.flags.len())?;
        let flag = &mut self.flags[index];

        if flag.is_linked() {
            return Err(Rejection::AlreadyHeld);
        }

        let dx = grab.pos[0] - flag.position[0];
        let dz = grab.pos[2] - flag.position[2];
        let distance = (dx * dx + dz * dz).sqrt();
        if !distance.is_finite() || distance >= GRAB_RADIUS {
            return Err(Rejection::TooFar);
        }

        flag.holder = Some(grabber);
        flag.fall_mode = false;
        flag.at_start_position = false;
        flag.idle_timer = 0;
        info!("Session {} grabbed flag {}", grabber, index);
        Ok(())
    }

    /// Knocks a flag off `target` and scatters it around the attacker.
    pub fn attack<R: Rng>(
        &mut self,
        attacker: SessionId,
        attacker_pos: [f32; 3],
        flag_id: u32,
        target: SessionId,
        rng: &mut R,
    ) -> Result<(), Rejection> {
        let index = flag_index(flag_id, self.flags.len())?;
        let flag = &mut self.flags[index];

        if flag.holder != Some(target) {
            return Err(Rejection::NotHolder);
        }

        let origin = [
            attacker_pos[0] + rng.gen_range(-ATTACK_SCATTER..ATTACK_SCATTER),
            attacker_pos[1] + ATTACK_LIFT,
            attacker_pos[2] + rng.gen_range(-ATTACK_SCATTER..ATTACK_SCATTER),
        ];
        flag.drop_from(origin);
        info!(
            "Session {} knocked flag {} off session {}",
            attacker, index, target
        );
        Ok(())
    }

    /// Releases every flag held by `holder`.
    ///
    /// The fall starts just above `last_position`; without one it starts from
    /// where the flag was last seen loose.
    pub fn release_held_by(&mut self, holder: SessionId, last_position: Option<[f32; 3]>) {
        for (index, flag) in self.flags.iter_mut().enumerate() {
            if flag.holder != Some(holder) {
                continue;
            }
            let base = last_position.unwrap_or(flag.position);
            flag.drop_from([base[0], base[1] + DROP_LIFT, base[2]]);
            debug!("Flag {} released by departing session {}", index, holder);
        }
    }

    /// Advances fall and respawn timers by one primary tick.
    pub fn tick(&mut self) {
        for flag in &mut self.flags {
            if flag.fall_mode && flag.position[1] > FALL_FLOOR {
                flag.position[1] = (flag.position[1] - FALL_SPEED).max(FALL_FLOOR);
            }

            if !flag.is_linked() && !flag.at_start_position {
                flag.idle_timer += 1;
                if flag.idle_timer >= IDLE_RESET_TICKS {
                    flag.reset();
                }
            }
        }
    }

    /// Wire form of every flag, in index order.
    pub fn snapshot(&self) -> Vec<FlagState> {
        self.flags.iter().map(Flag::to_wire).collect()
    }

    /// Number of flags bound to `holder`.
    pub fn held_by(&self, holder: SessionId) -> usize {
        self.flags
            .iter()
            .filter(|flag| flag.holder == Some(holder))
            .count()
    }
}

impl Default for FlagGame {
    fn default() -> Self {
        Self::new()
    }
}
