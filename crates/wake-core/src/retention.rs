// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Retention policy for log history.
//!
//! The retention window bounds how long a transaction stays replayable
//! after the epoch that could have absorbed it was finalized. Ages are
//! measured against the canonical checkpoint's `min_wall_clock`; until a
//! first checkpoint exists there is no reference time and nothing is
//! considered ancient.

use crate::record::Watermark;

/// How long missed transactions and idle client watermarks are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Keep everything. No transaction is ever ancient and no watermark is
    /// ever pruned.
    #[default]
    Infinite,

    /// Sliding window in milliseconds. Must be positive.
    Window(i64),
}

impl Retention {
    /// Returns `true` when a transaction with `wall_clock` is older than
    /// the window relative to `reference_ms` (the canonical checkpoint's
    /// `min_wall_clock`).
    #[must_use]
    pub fn is_ancient(self, reference_ms: i64, wall_clock: i64) -> bool {
        match self {
            Self::Infinite => false,
            Self::Window(window) => reference_ms.saturating_sub(wall_clock) > window,
        }
    }

    /// Returns `true` when a client watermark has been idle past the window
    /// relative to a new checkpoint's `min_wall_clock`.
    #[must_use]
    pub fn prunes_watermark(self, min_wall_clock: i64, watermark: &Watermark) -> bool {
        match self {
            Self::Infinite => false,
            Self::Window(window) => {
                min_wall_clock.saturating_sub(watermark.max_wall_clock) > window
            }
        }
    }
}
