use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Per-device monotonic timestamp assignment at millisecond resolution.
///
/// The wide-column clustering key includes the timestamp; two readings from
/// one device within the same millisecond would overwrite each other. `next`
/// bumps a colliding candidate to `last + 1ms`, so per device the returned
/// sequence is strictly increasing while distinct devices stay independent.
///
/// One instance lives for the process lifetime; the map grows with active
/// device cardinality, which is acceptable for a bounded fleet.
pub struct TsDeduper {
    last: Mutex<HashMap<String, i64>>,
}

impl TsDeduper {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a time that is unique and monotonic per device, never before
    /// `candidate`.
    pub fn next(&self, device_id: &str, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let mut ms = candidate.timestamp_millis();
        let mut last = self.last.lock();
        if let Some(&previous) = last.get(device_id) {
            if ms <= previous {
                ms = previous + 1;
            }
        }
        last.insert(device_id.to_string(), ms);
        DateTime::from_timestamp_millis(ms).unwrap_or(candidate)
    }
}

impl Default for TsDeduper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn same_millisecond_bumps_by_one() {
        let deduper = TsDeduper::new();
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        let first = deduper.next("D1", t);
        let second = deduper.next("D1", t);
        let third = deduper.next("D1", t);

        assert_eq!(first, t);
        assert_eq!(second, t + chrono::Duration::milliseconds(1));
        assert_eq!(third, t + chrono::Duration::milliseconds(2));
    }

    #[test]
    fn never_moves_backwards() {
        let deduper = TsDeduper::new();
        let late = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 5).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        assert_eq!(deduper.next("D1", late), late);
        // An earlier candidate still lands after the last assigned stamp.
        assert_eq!(
            deduper.next("D1", early),
            late + chrono::Duration::milliseconds(1)
        );
    }

    #[test]
    fn devices_are_independent() {
        let deduper = TsDeduper::new();
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        assert_eq!(deduper.next("D1", t), t);
        assert_eq!(deduper.next("D2", t), t);
    }

    #[test]
    fn advancing_candidate_passes_through() {
        let deduper = TsDeduper::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::milliseconds(500);

        assert_eq!(deduper.next("D1", t0), t0);
        assert_eq!(deduper.next("D1", t1), t1);
    }
}
