//! The slow-sync adaptive sleep calculator.
//!
//! A replica polls a producer with `GetBlockRange` and naps between
//! polls. The nap length is recalibrated from the recent reply
//! statistics: mostly-empty replies mean we poll too often, replies
//! with several blocks each mean we poll too rarely and lag behind.

use std::time::Duration;

use tracing::debug;

use crate::params::SyncParameters;

/// The number of replies observed between recalibrations.
pub const REPLIES_BEFORE_CALIBRATION: u32 = 20;

/// Recalibrate downwards only when more than this share of replies were
/// empty.
const SLOW_DOWN_FAILURE_RATE: f64 = 0.31;

/// Recalibrate upwards only when replies carried more than this many
/// blocks on average.
const SPEED_UP_BLOCKS_PER_REPLY: f64 = 1.31;

/// Derives a new polling interval from recent reply statistics.
///
/// Pure and unclamped; [`SleepStats`] applies the configured bounds.
/// A high failure rate stretches the sleep proportionally. A high
/// average block count shrinks it, damped by half the inverse average
/// to avoid oscillating around the producers' block rate.
pub fn next_sleep(current: Duration, failure_rate: f64, avg_blocks_found: f64) -> Duration {
    if failure_rate > SLOW_DOWN_FAILURE_RATE && avg_blocks_found < SPEED_UP_BLOCKS_PER_REPLY {
        current.mul_f64(1.0 + failure_rate)
    } else if avg_blocks_found > SPEED_UP_BLOCKS_PER_REPLY && failure_rate < SLOW_DOWN_FAILURE_RATE
    {
        current.mul_f64(1.0 - 0.5 * (1.0 / avg_blocks_found))
    } else {
        current
    }
}

/// Reply counters and the current sleep, recalibrated every
/// [`REPLIES_BEFORE_CALIBRATION`] observations.
#[derive(Clone, Debug)]
pub struct SleepStats {
    no_block_replies: u32,
    have_block_replies: u32,
    blocks_since_calibration: u64,
    current_sleep: Duration,
}

impl SleepStats {
    /// Starts at the longest configured nap: a fresh replica has no
    /// evidence the producers are fast, and politeness is the default.
    pub fn new(params: &SyncParameters) -> Self {
        SleepStats {
            no_block_replies: 0,
            have_block_replies: 0,
            blocks_since_calibration: 0,
            current_sleep: params.slow_sync_max_sleep,
        }
    }

    /// The current nap length.
    pub fn current_sleep(&self) -> Duration {
        self.current_sleep
    }

    /// Records one reply carrying `processed_blocks` blocks, and
    /// recalibrates on every [`REPLIES_BEFORE_CALIBRATION`]th.
    pub fn observe(&mut self, processed_blocks: usize, params: &SyncParameters) {
        if processed_blocks == 0 {
            self.no_block_replies += 1;
        } else {
            self.have_block_replies += 1;
            self.blocks_since_calibration += processed_blocks as u64;
        }

        if self.no_block_replies + self.have_block_replies >= REPLIES_BEFORE_CALIBRATION {
            self.recalibrate(params);
        }
    }

    fn recalibrate(&mut self, params: &SyncParameters) {
        let total = self.no_block_replies + self.have_block_replies;
        let failure_rate = f64::from(self.no_block_replies) / f64::from(total);
        let avg_blocks_found = if self.have_block_replies > 0 {
            self.blocks_since_calibration as f64 / f64::from(self.have_block_replies)
        } else {
            0.0
        };

        let unclamped = next_sleep(self.current_sleep, failure_rate, avg_blocks_found);
        self.current_sleep =
            unclamped.clamp(params.slow_sync_min_sleep, params.slow_sync_max_sleep);
        debug!(
            failure_rate,
            avg_blocks_found,
            sleep_ms = self.current_sleep.as_millis() as u64,
            "recalibrated slow sync sleep",
        );

        self.no_block_replies = 0;
        self.have_block_replies = 0;
        self.blocks_since_calibration = 0;
    }
}
