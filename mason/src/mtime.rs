// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Modification-time representation.
//!
//! Timestamps travel through atomics, so the representation is a plain
//! nanosecond count since the epoch with two reserved sentinels.

use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

/// A filesystem timestamp in a form suitable for `AtomicI64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Not yet queried
    pub const UNKNOWN: Timestamp = Timestamp(i64::MIN);

    /// Queried and the entity does not exist
    pub const NONEXISTENT: Timestamp = Timestamp(i64::MIN + 1);

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Mtime of `path`, or `NONEXISTENT`
    pub fn of(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => Self::from_filetime(FileTime::from_last_modification_time(&meta)),
            Err(_) => Timestamp::NONEXISTENT,
        }
    }

    pub fn from_filetime(ft: FileTime) -> Self {
        Timestamp(ft.unix_seconds().saturating_mul(1_000_000_000).saturating_add(ft.nanoseconds() as i64))
    }

    pub fn to_filetime(self) -> FileTime {
        FileTime::from_unix_time(self.0.div_euclid(1_000_000_000), self.0.rem_euclid(1_000_000_000) as u32)
    }

    pub fn from_raw(raw: i64) -> Self {
        Timestamp(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_real(self) -> bool {
        self != Timestamp::UNKNOWN && self != Timestamp::NONEXISTENT
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        match st.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(d.as_nanos().min(i64::MAX as u128) as i64),
            // Pre-epoch mtimes collapse towards the sentinel floor
            Err(e) => Timestamp(-(e.duration().as_nanos().min((i64::MAX - 2) as u128) as i64)),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        if ts.0 >= 0 {
            UNIX_EPOCH + Duration::from_nanos(ts.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_nanos(ts.0.unsigned_abs())
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::UNKNOWN => f.write_str("<unknown>"),
            Timestamp::NONEXISTENT => f.write_str("<nonexistent>"),
            Timestamp(ns) => write!(f, "{}.{:09}s", ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000)),
        }
    }
}
