//! Difficulty retargeting (§4.4 rule 3). The exact curve is left to the
//! implementer by the source material; this is a proportional adjustment
//! in zero-bit-exponent space rather than the reference chain's 256-bit
//! target arithmetic, clamped the same way the reference clamps its own
//! window (actual time bounded to within 4x of the target window before
//! it is allowed to move the difficulty at all).

use super::constants::{MAX_ZERO_BITS, MIN_ZERO_BITS, RETARGET_PERIOD, TARGET_SECS_PER_BLOCK};

/// Computes the `zero_bits` to use for the block at `height`, given the
/// `zero_bits` in force up to now and, if `height` lands on a retarget
/// boundary, the wall-clock seconds the just-finished window actually took.
pub fn expected_zero_bits(height: u64, current_zero_bits: u32, window_actual_secs: Option<u64>) -> u32 {
    if height == 0 || !height.is_multiple_of(RETARGET_PERIOD) {
        return current_zero_bits;
    }
    let Some(actual_secs) = window_actual_secs else {
        return current_zero_bits;
    };
    retarget(current_zero_bits, actual_secs)
}

fn retarget(current_zero_bits: u32, actual_secs: u64) -> u32 {
    let target_total = TARGET_SECS_PER_BLOCK.saturating_mul(RETARGET_PERIOD);
    let min_total = (target_total / 4).max(1);
    let max_total = target_total * 4;
    let clamped = actual_secs.clamp(min_total, max_total).max(1);

    let mut bits = current_zero_bits as i64;
    if target_total > clamped {
        // window finished faster than targeted: chain got easier than it
        // should have, raise difficulty.
        let mut ratio = target_total / clamped;
        while ratio > 1 {
            bits += 1;
            ratio /= 2;
        }
    } else if clamped > target_total {
        let mut ratio = clamped / target_total;
        while ratio > 1 {
            bits -= 1;
            ratio /= 2;
        }
    }
    bits.clamp(MIN_ZERO_BITS as i64, MAX_ZERO_BITS as i64) as u32
}
