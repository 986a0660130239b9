// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// Totally ordered identifier for task events: `task_<timestamp-ms>_<seq>`.
///
/// The sequence disambiguates events generated within the same
/// millisecond, so ids stay unique and monotonic under any event rate.
/// Ids are not durable across process restarts; task streams are not
/// expected to survive them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskEventId {
    pub timestamp_ms: u64,
    pub seq: u64,
}

impl TaskEventId {
    /// Timestamp-then-sequence ordering.
    pub fn is_after(&self, other: &TaskEventId) -> bool {
        (self.timestamp_ms, self.seq) > (other.timestamp_ms, other.seq)
    }

    /// Parse a `task_<ts>_<seq>` string; anything else is rejected.
    pub fn parse(s: &str) -> Option<TaskEventId> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| Regex::new(r"^task_(\d+)_(\d+)$").expect("valid regex"));
        let caps = re.captures(s)?;
        Some(TaskEventId {
            timestamp_ms: caps[1].parse().ok()?,
            seq: caps[2].parse().ok()?,
        })
    }
}

impl fmt::Display for TaskEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}_{}", self.timestamp_ms, self.seq)
    }
}

impl FromStr for TaskEventId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

/// Generator state: (last timestamp, sequence).  The sequence increments
/// while the clock reads the same millisecond and resets when it
/// advances.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last_timestamp: u64,
    seq: u64,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next id for the given clock reading.  A clock that
    /// jumps backwards does not regress the id stream; the sequence keeps
    /// climbing on the last seen timestamp.
    pub fn next(&mut self, now_ms: u64) -> TaskEventId {
        if now_ms > self.last_timestamp {
            self.last_timestamp = now_ms;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        TaskEventId {
            timestamp_ms: self.last_timestamp,
            seq: self.seq,
        }
    }
}

/// Process-wide generator, shared by every agent in the process so ids
/// stay monotonic even across concurrently running agents.
pub fn generate() -> TaskEventId {
    static GLOBAL: OnceLock<Mutex<EventIdGenerator>> = OnceLock::new();
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    GLOBAL
        .get_or_init(|| Mutex::new(EventIdGenerator::new()))
        .lock()
        .expect("event id generator poisoned")
        .next(now_ms)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
