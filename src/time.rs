//! Wall-clock helpers: `(sec, usec)` pairs, matching the precision the wire
//! protocol expects (`start`, `stop`, `ru_utime`, `ru_stime` are all
//! `sec.usec` with 6-digit microseconds).

use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock timestamp with microsecond precision, mirroring `struct timeval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        TimeVal {
            sec: d.as_secs() as i64,
            usec: d.subsec_micros() as i64,
        }
    }

    /// `self + secs` seconds.
    pub fn plus_secs(self, secs: i64) -> Self {
        TimeVal {
            sec: self.sec + secs,
            usec: self.usec,
        }
    }

    /// Milliseconds from `self` until `other` (may be negative if `other` is in the past).
    pub fn delta_ms(self, other: TimeVal) -> i64 {
        (other.sec - self.sec) * 1000 + (other.usec - self.usec) / 1000
    }

    /// Elapsed seconds between `self` (start) and `other` (stop), as a float.
    pub fn delta_secs_f64(self, other: TimeVal) -> f64 {
        (other.sec - self.sec) as f64 + (other.usec - self.usec) as f64 / 1_000_000.0
    }

    /// Render as `sec.usec` with 6-digit zero-padded microseconds, per the wire format.
    pub fn to_wire_string(self) -> String {
        format!("{}.{:06}", self.sec, self.usec)
    }
}

/// Build a `struct rusage`-style `sec.usec` string from a `libc::timeval`.
pub fn timeval_to_wire_string(tv: libc::timeval) -> String {
    TimeVal {
        sec: tv.tv_sec as i64,
        usec: tv.tv_usec as i64,
    }
    .to_wire_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_string_pads_microseconds() {
        let tv = TimeVal { sec: 100, usec: 5 };
        assert_eq!(tv.to_wire_string(), "100.000005");
    }

    #[test]
    fn delta_ms_accounts_for_usec() {
        let a = TimeVal { sec: 10, usec: 900_000 };
        let b = TimeVal { sec: 11, usec: 100_000 };
        assert_eq!(a.delta_ms(b), 200);
    }

    #[test]
    fn delta_secs_f64_matches_seconds() {
        let a = TimeVal { sec: 0, usec: 0 };
        let b = TimeVal { sec: 2, usec: 500_000 };
        assert!((a.delta_secs_f64(b) - 2.5).abs() < 1e-9);
    }
}
