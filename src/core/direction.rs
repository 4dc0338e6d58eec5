//! Travel direction detection with hysteresis.
//!
//! Glancing back at the previous image must not flip the look-ahead window, so a
//! direction change is only declared once the net steps taken against the
//! current direction reach [`FLIP_THRESHOLD`]. At either end of the list the
//! direction is forced towards the open side.

use log::trace;

use super::control::{CacheControl, Direction};

/// Net opposite steps needed before the declared direction flips
pub const FLIP_THRESHOLD: i64 = 3;

/// Update `current_key`, `previous_key`, `direction` and the hysteresis
/// accumulator for a move to `key` in a list of `len` items.
pub fn update_direction(ctl: &mut CacheControl, key: usize, len: usize) {
    ctl.previous_key = ctl.current_key;
    ctl.current_key = key;

    if len == 0 {
        ctl.hysteresis = 0;
        return;
    }

    if key == 0 {
        ctl.direction = Direction::Forward;
        ctl.hysteresis = 0;
        return;
    }
    if key >= len - 1 {
        ctl.direction = Direction::Backward;
        ctl.hysteresis = 0;
        return;
    }

    let step = key as i64 - ctl.previous_key as i64;
    if step == 0 {
        return;
    }

    if step.signum() == ctl.direction.sign() {
        ctl.hysteresis = 0;
        return;
    }

    ctl.hysteresis += step;
    if ctl.hysteresis.abs() >= FLIP_THRESHOLD {
        ctl.direction = ctl.direction.flipped();
        ctl.hysteresis = 0;
        trace!("direction flipped to {:?} at key {}", ctl.direction, key);
    }
}
