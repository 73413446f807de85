//! Timing and progress estimation. The raw estimate combines the
//! historical rate with the current step's (possibly delegated) progress,
//! each weighted by a confidence that ramps up with observed time; a
//! second pass massages the result so the displayed remaining time never
//! climbs abruptly or jitters.

use super::OpData;
use crate::clock::{ticks_since, Ticks};
use crate::frac::{Frac, FRAC_ZERO};
use static_assertions::const_assert;
use std::collections::HashMap;

// Confidence ramp for observed child times (centi-seconds).
const CONFIDENT_MIN: u32 = 200;
const CONFIDENT_MAX: u32 = 500;

// Settings for the presentation pass (centi-seconds unless noted).
const PRETTY_INIT: u32 = 300;
const PRETTY_HIDE: u32 = 1000;
const PRETTY_STEP: u32 = 50;
const PRETTY_DOWN_PERC: u32 = 25;
const PRETTY_DOWN_MIN_TIME: u32 = 300;
const PRETTY_DOWN_MAX_TIME: u32 = 1000;
const PRETTY_UP_PERC: u32 = 50;
const PRETTY_UP_MIN_TIME: u32 = 200;
const PRETTY_UP_MAX_TIME: u32 = 1000;
const PRETTY_UP_ERROR: u32 = 500;
/// Hundredths of a percent of the outstanding error bled in per
/// centi-second of interval.
const PRETTY_PERC_ERROR: u32 = 25;

const_assert!(CONFIDENT_MIN < CONFIDENT_MAX);
const_assert!(PRETTY_INIT < PRETTY_HIDE);

/// State for the monotone-friendly presentation of remaining time.
#[derive(Clone, Debug, Default)]
pub(super) struct Pretty {
    total: u32,
    base: u32,
    error: i32,
    last: u32,
}

/// Combine two values, taking their relative confidence into account.
/// Zero values are assumed to be invalid.
fn combine(a: u32, mut conf_a: Frac, b: u32, mut conf_b: Frac) -> u32 {
    if a == 0 {
        conf_a = FRAC_ZERO;
    }
    if b == 0 {
        conf_b = FRAC_ZERO;
    }
    conf_a
        .add(conf_b)
        .inv_scale(conf_a.scale(a).wrapping_add(conf_b.scale(b)))
}

fn elapsed(op: &OpData, now: Ticks) -> u32 {
    ticks_since(now, op.time_start).max(0) as u32
}

/// Recursively calculate (taken, remaining) for an operation, in
/// centi-seconds.
pub(super) fn compute_time(
    ops: &HashMap<u32, OpData>,
    op: &OpData,
    now: Ticks,
) -> (u32, u32) {
    let mut child_taken = 0;
    let mut child_remain = 0;
    if !op.time_running {
        if let Some(child) = op.child.and_then(|h| ops.get(&h)) {
            let (taken, remain) = compute_time(ops, child, now);
            child_taken = taken;
            child_remain = remain;
        }
    }

    let mut taken = op.time_acc.wrapping_add(child_taken);
    if op.time_running {
        taken = taken.wrapping_add(elapsed(op, now));
    }

    // Estimate the total from previous steps alone.
    let mut total = op.frac_done.inv_scale(op.time_done);

    // Estimate the current step, blending the step fraction against the
    // child's own progress once the child has run long enough to trust.
    let mut frac_child = Frac::create(child_taken, op.time_done);
    if child_taken < CONFIDENT_MIN {
        frac_child = FRAC_ZERO;
    } else if child_taken < CONFIDENT_MAX {
        let ramp = Frac::create(child_taken - CONFIDENT_MIN, CONFIDENT_MAX - CONFIDENT_MIN);
        if ramp < frac_child {
            frac_child = ramp;
        }
    }
    let mut step = combine(
        op.frac_step.scale(total),
        frac_child.not(),
        child_taken.wrapping_add(child_remain),
        frac_child,
    );

    // The step can be no quicker than what has already been observed.
    step = step.max(child_taken);
    step = step.max(taken.saturating_sub(op.time_done));

    // Fold the step estimate back into the total, then refine with the
    // known completed portion.
    total = combine(
        total,
        op.frac_done,
        op.frac_step.inv_scale(step),
        op.frac_step,
    );
    total = op
        .time_done
        .wrapping_add(step)
        .wrapping_add(op.frac_done.add(op.frac_step).not().scale(total));

    let remain = if total != 0 {
        total.saturating_sub(taken)
    } else {
        0
    };
    (taken, remain)
}

/// Massage the remaining time for presentation. The smoother is bypassed
/// early on, and the estimate is hidden entirely until enough time has
/// passed for it to mean anything.
pub(super) fn pretty_time(op: &mut OpData, taken: u32, remain: &mut u32) {
    if PRETTY_INIT < taken {
        let interval = taken.saturating_sub(op.pretty.last);

        // Preserve the last estimate unless time moved significantly.
        if PRETTY_STEP < interval {
            let total = taken.wrapping_add(*remain);
            let offset = taken.saturating_sub(op.pretty.base);
            let mut error = total as i64 - i64::from(op.pretty.total);
            let mut reset = false;

            if error < 0 {
                // New estimate is less than previous.
                if op.pretty.error < 0 {
                    if i64::from(op.pretty.error) < error {
                        op.pretty.error = error as i32;
                    } else {
                        let bleed = Frac::create(interval.saturating_mul(PRETTY_PERC_ERROR), 10_000)
                            .scale((i64::from(op.pretty.error) - error) as u32);
                        op.pretty.error -= bleed as i32;
                    }
                    if PRETTY_DOWN_MIN_TIME < offset
                        && (offset < PRETTY_DOWN_MAX_TIME
                            || remain.saturating_mul(PRETTY_DOWN_PERC) / 100
                            < op.pretty.error.unsigned_abs())
                    {
                        // Include the error.
                        op.pretty.total =
                            (i64::from(op.pretty.total) + i64::from(op.pretty.error)).max(0) as u32;
                        op.pretty.error = -1;
                    }
                } else {
                    reset = true;
                }
            } else {
                // New estimate is more than previous.
                if op.pretty.total < taken {
                    // End of the prettified estimate reached.
                    op.pretty.total = total;
                    error = 1;
                    reset = true;
                } else if 0 < op.pretty.error {
                    if error < i64::from(op.pretty.error) {
                        op.pretty.error = error as i32;
                    } else {
                        let bleed = Frac::create(interval.saturating_mul(PRETTY_PERC_ERROR), 10_000)
                            .scale((error - i64::from(op.pretty.error)) as u32);
                        op.pretty.error += bleed as i32;
                    }
                    if PRETTY_UP_MIN_TIME < offset
                        && (offset < PRETTY_UP_MAX_TIME
                            || remain.saturating_mul(PRETTY_UP_PERC) / 100
                            < op.pretty.error as u32)
                    {
                        if (op.pretty.error as u32) < PRETTY_UP_ERROR
                            && PRETTY_UP_MAX_TIME + PRETTY_UP_ERROR
                                < taken.saturating_sub(op.pretty.base)
                        {
                            op.pretty.total = op.pretty.total.wrapping_add(interval);
                        } else {
                            op.pretty.total =
                                op.pretty.total.wrapping_add(op.pretty.error as u32);
                            op.pretty.error = 1;
                        }
                    }
                } else {
                    reset = true;
                }
            }

            if reset {
                op.pretty.error = error as i32;
                op.pretty.base = taken;
            }
            op.pretty.last = taken;
        }

        *remain = if taken < op.pretty.total {
            op.pretty.total - taken
        } else {
            0
        };
    }

    // Hide the time remaining if the operation has only just started.
    if taken < PRETTY_HIDE {
        *remain = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_weights_by_confidence() {
        let full = crate::frac::FRAC_ONE;
        assert_eq!(combine(100, full, 0, full), 100);
        assert_eq!(combine(0, full, 80, full), 80);
        let half = Frac::create(1, 2);
        let blended = combine(100, half, 200, half);
        assert!((140..=160).contains(&blended), "blended {}", blended);
    }

    #[test]
    fn combine_of_two_invalids_is_zero() {
        assert_eq!(combine(0, crate::frac::FRAC_ONE, 0, crate::frac::FRAC_ONE), 0);
    }
}
