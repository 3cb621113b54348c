//! crates/booking_core/src/slots.rs
//!
//! Pure rules for the availability slot list: parsing, normalisation, the
//! consume/release algebra and the external-calendar busy filter.
//!
//! Slots are stored as zero-padded `HH:MM` strings in the platform's local offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

const TIME_FORMATS: [&str; 4] = ["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p"];

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Parses any accepted time spelling into a `NaiveTime`.
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
}

/// Returns the canonical `HH:MM` form of a slot time.
pub fn normalize_time(raw: &str) -> Option<String> {
    parse_time(raw).map(|t| t.format("%H:%M").to_string())
}

/// Normalises, de-duplicates and sorts a list of slot strings.
///
/// Returns the first unparseable entry as the error.
pub fn normalize_slots<I, S>(raw: I) -> Result<Vec<String>, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut slots = Vec::new();
    for entry in raw {
        let entry = entry.as_ref();
        let time = normalize_time(entry).ok_or_else(|| entry.to_string())?;
        if !slots.contains(&time) {
            slots.push(time);
        }
    }
    slots.sort();
    Ok(slots)
}

/// Removes `time` from the list. Removing an absent slot is a no-op.
///
/// Returns whether the list changed.
pub fn consume(slots: &mut Vec<String>, time: &str) -> bool {
    let before = slots.len();
    slots.retain(|s| s != time);
    before != slots.len()
}

/// Adds `time` back to the list, keeping it sorted and free of duplicates.
///
/// Returns whether the list changed.
pub fn release(slots: &mut Vec<String>, time: &str) -> bool {
    if slots.iter().any(|s| s == time) {
        return false;
    }
    let at = slots.partition_point(|s| s.as_str() < time);
    slots.insert(at, time.to_string());
    true
}

/// Converts a local slot (date + `HH:MM`) to its UTC start instant.
pub fn slot_start_utc(date: NaiveDate, time: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let time = parse_time(time)?;
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses an offset such as `+05:30`, `-04:00` or `Z`.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

//=========================================================================================
// External Calendar Busy Filter
//=========================================================================================

/// One busy period read from a psychologist's external calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInterval {
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Decides which external events block availability.
#[derive(Debug, Clone)]
pub struct BusyFilter {
    pub platform_prefix: String,
    pub holiday_keywords: Vec<String>,
    pub offset: FixedOffset,
    pub slot_length: Duration,
}

impl BusyFilter {
    /// Events created by the platform itself, or public holidays, never block a slot.
    pub fn ignores(&self, interval: &BusyInterval) -> bool {
        let summary = interval.summary.trim().to_lowercase();
        let prefix = self.platform_prefix.trim().to_lowercase();
        if !prefix.is_empty() && summary.starts_with(&prefix) {
            return true;
        }
        self.holiday_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .any(|k| !k.is_empty() && summary.contains(&k))
    }

    /// Returns the slots of `date` that do not overlap any blocking interval.
    pub fn free_slots(&self, date: NaiveDate, slots: &[String], busy: &[BusyInterval]) -> Vec<String> {
        let blocking: Vec<&BusyInterval> = busy.iter().filter(|b| !self.ignores(b)).collect();
        slots
            .iter()
            .filter(|slot| {
                let Some(start) = slot_start_utc(date, slot, self.offset) else {
                    return false;
                };
                let end = start + self.slot_length;
                !blocking.iter().any(|b| start < b.end && b.start < end)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn filter() -> BusyFilter {
        BusyFilter {
            platform_prefix: "Therapy Session".to_string(),
            holiday_keywords: vec!["holiday".to_string()],
            offset: ist(),
            slot_length: Duration::minutes(60),
        }
    }

    fn at(date: NaiveDate, time: &str) -> DateTime<Utc> {
        slot_start_utc(date, time, ist()).unwrap()
    }

    #[rstest]
    #[case("9:00", Some("09:00"))]
    #[case("10:30:00", Some("10:30"))]
    #[case("02:15 PM", Some("14:15"))]
    #[case("25:00", None)]
    #[case("soon", None)]
    fn normalizes_time_spellings(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_time(raw).as_deref(), expected);
    }

    #[test]
    fn normalize_slots_sorts_and_dedupes() {
        let slots = normalize_slots(["11:00", "9:00", "09:00", "10:00"]).unwrap();
        assert_eq!(slots, vec!["09:00", "10:00", "11:00"]);
        assert_eq!(normalize_slots(["10:00", "nope"]), Err("nope".to_string()));
    }

    #[test]
    fn consume_is_idempotent() {
        let mut slots = vec!["10:00".to_string(), "11:00".to_string()];
        assert!(consume(&mut slots, "10:00"));
        assert!(!consume(&mut slots, "10:00"));
        assert_eq!(slots, vec!["11:00"]);
    }

    #[test]
    fn release_never_duplicates_and_keeps_order() {
        let mut slots = vec!["09:00".to_string(), "11:00".to_string()];
        assert!(release(&mut slots, "10:00"));
        assert!(!release(&mut slots, "10:00"));
        assert_eq!(slots, vec!["09:00", "10:00", "11:00"]);
    }

    #[test]
    fn release_then_consume_round_trips() {
        let original = vec!["09:00".to_string(), "11:00".to_string()];
        let mut slots = original.clone();
        release(&mut slots, "10:00");
        consume(&mut slots, "10:00");
        assert_eq!(slots, original);

        let mut slots = original.clone();
        consume(&mut slots, "09:00");
        release(&mut slots, "09:00");
        assert_eq!(slots, original);
    }

    #[rstest]
    #[case("+05:30", 19800)]
    #[case("-04:00", -14400)]
    #[case("Z", 0)]
    fn parses_offsets(#[case] raw: &str, #[case] seconds: i32) {
        assert_eq!(parse_offset(raw).unwrap().local_minus_utc(), seconds);
    }

    #[test]
    fn rejects_bad_offsets() {
        assert!(parse_offset("05:30").is_none());
        assert!(parse_offset("+99:00").is_none());
    }

    #[test]
    fn busy_interval_removes_overlapping_slots_only() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let slots = vec!["09:00".to_string(), "10:00".to_string(), "11:00".to_string()];
        let busy = vec![BusyInterval {
            summary: "Dentist".to_string(),
            start: at(date, "10:30"),
            end: at(date, "11:00"),
        }];
        assert_eq!(filter().free_slots(date, &slots, &busy), vec!["09:00", "11:00"]);
    }

    #[test]
    fn platform_bookings_and_holidays_are_ignored() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let slots = vec!["09:00".to_string(), "10:00".to_string()];
        let busy = vec![
            BusyInterval {
                summary: "Therapy Session with Asha".to_string(),
                start: at(date, "09:00"),
                end: at(date, "10:00"),
            },
            BusyInterval {
                summary: "Public Holiday - Holi".to_string(),
                start: at(date, "00:00"),
                end: at(date, "23:59"),
            },
        ];
        assert_eq!(filter().free_slots(date, &slots, &busy), slots);
    }

    #[test]
    fn all_day_event_blocks_the_day() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let slots = vec!["09:00".to_string(), "18:00".to_string()];
        let busy = vec![BusyInterval {
            summary: "Conference".to_string(),
            start: at(date, "00:00"),
            end: at(date.succ_opt().unwrap(), "00:00"),
        }];
        assert!(filter().free_slots(date, &slots, &busy).is_empty());
    }
}
