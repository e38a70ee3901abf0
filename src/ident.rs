// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event identifiers and subscriber cursors.
//!
//! Two identifier shapes travel on the wire:
//!
//! - **Operation ids** ([`OpId`]) are assigned by the store at append time
//!   and render as 24 lower-hex characters. They are strictly increasing
//!   in insertion order (wall-clock millisecond plus a sequence counter).
//! - **Replication ids** are plain decimal millisecond timestamps, at most
//!   13 digits long.
//!
//! A subscriber cursor ([`LastId`]) is one or the other; parsing is
//! deterministic by length and charset, so a resumed `Last-Event-ID`
//! header always lands back on the variant that produced it.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A store-assigned operation identifier.
///
/// Encodes the append wall-clock millisecond and a per-millisecond
/// sequence number. Ordering follows `(millis, seq)`, which matches
/// insertion order for ids produced by one [`OpIdGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct OpId {
    millis: u64,
    seq: u32,
}

impl OpId {
    #[must_use]
    pub fn new(millis: u64, seq: u32) -> Self {
        Self { millis, seq }
    }

    /// Append wall-clock millisecond embedded in the id.
    #[must_use]
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Per-millisecond sequence counter.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Parse the 24-char lower-hex wire form.
    ///
    /// Returns `None` unless the input is exactly 24 hex digits
    /// (16 for the millisecond, 8 for the sequence).
    #[must_use]
    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let millis = u64::from_str_radix(&s[..16], 16).ok()?;
        let seq = u32::from_str_radix(&s[16..], 16).ok()?;
        Some(Self { millis, seq })
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:08x}", self.millis, self.seq)
    }
}

impl From<OpId> for String {
    fn from(id: OpId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for OpId {
    type Error = CursorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse_hex(&s).ok_or(CursorError::Malformed(s))
    }
}

/// Error for unparsable cursor strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("invalid event id: {0:?}")]
    Malformed(String),
}

/// A subscriber cursor: the last event id the consumer has seen.
///
/// Dispatching on the variant selects the tail mode: an `Operation`
/// cursor resumes live tailing of the op-log, a `Replication` cursor
/// replays state snapshots by timestamp. `Replication { ts: 0,
/// fallback: false }` requests a full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastId {
    /// Resume the op-log strictly after this operation.
    Operation(OpId),
    /// Replay states with `ts >= ts`. `fallback` marks a cursor that was
    /// converted from an evicted operation id; such replays must include
    /// delete tombstones so the consumer stays consistent.
    Replication { ts: i64, fallback: bool },
}

impl LastId {
    /// The full-sync cursor: replay every stored state, then go live.
    #[must_use]
    pub fn full_sync() -> Self {
        Self::Replication { ts: 0, fallback: false }
    }

    /// Parse a wire cursor.
    ///
    /// All-digits with at most 13 characters parses as a replication
    /// timestamp; exactly 24 hex characters parses as an operation id;
    /// anything else is malformed.
    pub fn parse(s: &str) -> Result<Self, CursorError> {
        if !s.is_empty() && s.len() <= 13 && s.bytes().all(|b| b.is_ascii_digit()) {
            let ts = s
                .parse::<i64>()
                .map_err(|_| CursorError::Malformed(s.to_string()))?;
            return Ok(Self::Replication { ts, fallback: false });
        }
        if let Some(id) = OpId::parse_hex(s) {
            return Ok(Self::Operation(id));
        }
        Err(CursorError::Malformed(s.to_string()))
    }

    /// Convert an evicted operation cursor into a replication cursor.
    ///
    /// The replay starts at the id's embedded append millisecond, which
    /// is at or before the evicted operation's state `ts`, and carries
    /// tombstones (`fallback = true`). Replication cursors pass through
    /// unchanged.
    #[must_use]
    pub fn fallback(&self) -> Self {
        match *self {
            Self::Operation(id) => Self::Replication {
                ts: id.millis() as i64,
                fallback: true,
            },
            replication => replication,
        }
    }

    /// True for the cursor that triggers a `reset` control event.
    #[must_use]
    pub fn is_full_sync(&self) -> bool {
        matches!(self, Self::Replication { ts: 0, fallback: false })
    }
}

impl fmt::Display for LastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(id) => write!(f, "{id}"),
            Self::Replication { ts, .. } => write!(f, "{ts}"),
        }
    }
}

impl FromStr for LastId {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Monotonic [`OpId`] source shared by a store backend.
///
/// Ids never go backwards even if the wall clock does: a timestamp at or
/// before the last issued one reuses that millisecond and bumps the
/// sequence counter.
#[derive(Debug, Default)]
pub struct OpIdGenerator {
    last: Mutex<(u64, u32)>,
}

impl OpIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next id for the given wall-clock millisecond.
    pub fn next(&self, now_millis: u64) -> OpId {
        let mut last = self.last.lock();
        if now_millis > last.0 {
            *last = (now_millis, 0);
        } else {
            last.1 += 1;
        }
        OpId::new(last.0, last.1)
    }

    /// Ensure future ids sort after `id` (used when resuming over a log
    /// that already holds ids from a previous run).
    pub fn observe(&self, id: OpId) {
        let mut last = self.last.lock();
        if (id.millis(), id.seq()) >= *last {
            *last = (id.millis(), id.seq());
        }
    }
}
