// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Lamport-scoped composite keys for transactions and checkpoints.
//!
//! Key strings are the wire identity of log entries and must be bit-exact
//! across peers:
//!
//! - transaction: `"{epoch};{clock};{clientId};{wallClock}"`
//! - checkpoint:  `"{epoch};{txCount};{clientId}"`
//!
//! All components are decimal integers except the client id, which is
//! arbitrary UTF-8 without `';'`. A key that does not parse is fatal: peers
//! running this engine never write one, so it signals corruption or foreign
//! data in the shared map.
//!
//! Transaction ordering is epoch, then clock, then client id
//! (lexicographic). The wall clock participates in retention decisions but
//! is never a sort key.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FatalError;

/// Timestamp identifying one transaction in the shared log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxTimestamp {
    /// Epoch the transaction was emitted into.
    pub epoch: u64,
    /// Lamport clock value at emission.
    pub clock: u64,
    /// Emitting peer's identity. Never contains `';'`.
    pub client_id: String,
    /// Emitting peer's wall clock, milliseconds. Recorded at emission and
    /// never consulted during state derivation.
    pub wall_clock: i64,
}

impl TxTimestamp {
    /// Canonical key form.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{};{};{};{}",
            self.epoch, self.clock, self.client_id, self.wall_clock
        )
    }

    /// Parses a canonical transaction key.
    ///
    /// # Errors
    ///
    /// [`FatalError::MalformedTxKey`] on a wrong component count or a
    /// non-numeric component.
    pub fn parse(key: &str) -> Result<Self, FatalError> {
        let malformed = || FatalError::MalformedTxKey(key.to_owned());
        let mut parts = key.split(';');
        let epoch = parts.next().ok_or_else(malformed)?;
        let clock = parts.next().ok_or_else(malformed)?;
        let client_id = parts.next().ok_or_else(malformed)?;
        let wall_clock = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            epoch: epoch.parse().map_err(|_| malformed())?,
            clock: clock.parse().map_err(|_| malformed())?,
            client_id: client_id.to_owned(),
            wall_clock: wall_clock.parse().map_err(|_| malformed())?,
        })
    }

    /// Log ordering: epoch, then clock, then client id. The wall clock is
    /// deliberately excluded.
    #[must_use]
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.clock.cmp(&other.clock))
            .then_with(|| self.client_id.cmp(&other.client_id))
    }
}

impl fmt::Display for TxTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Identity of one checkpoint in the shared checkpoint map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Epoch this checkpoint finalizes.
    pub epoch: u64,
    /// Number of transactions absorbed from that epoch.
    pub tx_count: u64,
    /// Peer that produced the checkpoint.
    pub client_id: String,
}

impl CheckpointKey {
    /// Canonical key form.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{};{};{}", self.epoch, self.tx_count, self.client_id)
    }

    /// Parses a canonical checkpoint key.
    ///
    /// # Errors
    ///
    /// [`FatalError::MalformedCheckpointKey`] on a wrong component count or
    /// a non-numeric component.
    pub fn parse(key: &str) -> Result<Self, FatalError> {
        let malformed = || FatalError::MalformedCheckpointKey(key.to_owned());
        let mut parts = key.split(';');
        let epoch = parts.next().ok_or_else(malformed)?;
        let tx_count = parts.next().ok_or_else(malformed)?;
        let client_id = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            epoch: epoch.parse().map_err(|_| malformed())?,
            tx_count: tx_count.parse().map_err(|_| malformed())?,
            client_id: client_id.to_owned(),
        })
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
