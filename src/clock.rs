use std::sync::atomic::{AtomicI64, Ordering};

use chrono::DateTime;
use chrono_tz::Tz;

use crate::model::Ms;

/// Injected time source. Engine code never reads the system clock
/// directly; tests pin time with `FixedClock`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

/// Wall clock, used by the binary.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as Ms
    }
}

/// Clock pinned to an explicit instant, movable by hand.
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(at: Ms) -> Self {
        Self(AtomicI64::new(at))
    }

    pub fn set(&self, at: Ms) {
        self.0.store(at, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

/// Look up an IANA zone by name, `None` if unknown.
pub fn resolve_zone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

/// Convert a canonical instant to wall time in the given zone.
/// Callers validate `at` against the timestamp limits first.
pub fn at_zone(at: Ms, tz: Tz) -> DateTime<Tz> {
    DateTime::from_timestamp_millis(at)
        .expect("timestamp within validated range")
        .with_timezone(&tz)
}

/// RFC 3339 rendering of an instant in the given zone.
pub fn local_rfc3339(at: Ms, tz: Tz) -> String {
    at_zone(at, tz).to_rfc3339()
}

/// Availability label, e.g. `Monday 05.05.2025 14:00`.
pub fn slot_label(at: Ms, tz: Tz) -> String {
    at_zone(at, tz).format("%A %d.%m.%Y %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Europe::Prague;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn fixed_clock_moves_only_by_hand() {
        let c = FixedClock::new(1_000);
        assert_eq!(c.now_ms(), 1_000);
        c.advance(500);
        assert_eq!(c.now_ms(), 1_500);
        c.set(42);
        assert_eq!(c.now_ms(), 42);
    }

    #[test]
    fn resolve_zone_known_and_unknown() {
        assert_eq!(resolve_zone("Europe/Prague"), Some(Prague));
        assert!(resolve_zone("Mars/Olympus_Mons").is_none());
    }

    #[test]
    fn zone_conversion_summer_offset() {
        // 2025-05-05 12:00 UTC is 14:00 in Prague (CEST, +02:00).
        let at = utc_ms(2025, 5, 5, 12, 0);
        let local = at_zone(at, Prague);
        assert_eq!(local.format("%H:%M").to_string(), "14:00");
        assert!(local_rfc3339(at, Prague).ends_with("+02:00"));
    }

    #[test]
    fn zone_conversion_winter_offset() {
        // Same wall hour in January is CET, +01:00.
        let at = utc_ms(2025, 1, 6, 12, 0);
        assert!(local_rfc3339(at, Prague).ends_with("+01:00"));
    }

    #[test]
    fn slot_label_format() {
        let at = utc_ms(2025, 5, 5, 12, 0);
        assert_eq!(slot_label(at, Prague), "Monday 05.05.2025 14:00");
    }
}
