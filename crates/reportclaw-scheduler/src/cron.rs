//! Cadence parsing and occurrence math.
//!
//! Supports "MIN HOUR DOM MON DOW" (5-field, no seconds) with `*`, `N`, `A-B`,
//! `*/S`, `A-B/S`, `N/S`, comma lists, month and weekday names, the `@daily`
//! family of macros and fixed intervals (`@every 15m`, `@every 2h`, `@every 1d`).
//!
//! Expressions are evaluated in a fixed UTC offset ("UTC", "+02:00", "UTC-5")
//! or an IANA zone ("Europe/Berlin"). Occurrences have minute granularity.
//! In a named zone a wall-clock time skipped by a DST jump does not fire that
//! day, and a time repeated when clocks go back fires once, at its first pass.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::Cadence;

/// Longest gap searched between two occurrences (covers Feb 29 schedules).
const MAX_SEARCH_DAYS: i64 = 366 * 4 + 1;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, validated cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    zone: Zone,
    rule: Rule,
}

/// Timezone a cadence is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    /// Wall-clock time at `time`.
    fn local(&self, time: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Zone::Fixed(offset) => time.with_timezone(offset).naive_local(),
            Zone::Named(tz) => time.with_timezone(tz).naive_local(),
        }
    }

    /// Seconds east of UTC in effect at `time`.
    pub fn offset_at(&self, time: DateTime<Utc>) -> i64 {
        let fixed = match self {
            Zone::Fixed(offset) => *offset,
            Zone::Named(tz) => tz.offset_from_utc_datetime(&time.naive_utc()).fix(),
        };
        i64::from(fixed.local_minus_utc())
    }

    /// Earliest instant showing `naive` on the wall clock, if any.
    fn resolve(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Zone::Fixed(offset) => offset
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            Zone::Named(tz) => tz
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Fields(Fields),
    Every { secs: i64 },
}

/// Bit masks of allowed values per field.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fields {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Fields {
    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1u64 << date.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1u64 << date.day()) != 0;
        let dow = self.days_of_week & (1u64 << date.weekday().num_days_from_sunday()) != 0;
        // Classic cron: when both day fields are restricted either may match.
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.hours & (1u64 << hour) != 0
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.minutes & (1u64 << minute) != 0
    }
}

impl CronSchedule {
    /// Parse an expression evaluated in `timezone`.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let zone = parse_timezone(timezone)?;
        let trimmed = expression.trim();
        let rule = match trimmed.strip_prefix('@') {
            Some(rest) => parse_macro(rest)?,
            None => Rule::Fields(parse_fields(trimmed)?),
        };
        Ok(Self {
            expression: trimmed.to_string(),
            zone,
            rule,
        })
    }

    pub fn from_cadence(cadence: &Cadence) -> Result<Self> {
        Self::parse(&cadence.expression, &cadence.timezone)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Whether `time` (truncated to the minute) is an occurrence.
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        match &self.rule {
            Rule::Every { secs } => {
                let local = time.timestamp() + self.zone.offset_at(time);
                local.rem_euclid(*secs) < 60
            }
            Rule::Fields(fields) => {
                let local = self.zone.local(time);
                fields.day_matches(local.date())
                    && fields.hour_matches(local.hour())
                    && fields.minute_matches(local.minute())
            }
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.rule {
            Rule::Every { secs } => {
                let shift = self.zone.offset_at(after);
                let local = after.timestamp() + shift;
                let next = (local.div_euclid(*secs) + 1) * secs - shift;
                Utc.timestamp_opt(next, 0).single()
            }
            Rule::Fields(fields) => {
                let start = truncate_minute(self.zone.local(after)) + Duration::minutes(1);
                self.search_forward(fields, start, after)
            }
        }
    }

    /// Most recent occurrence at or before `at`.
    pub fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.rule {
            Rule::Every { secs } => {
                let shift = self.zone.offset_at(at);
                let local = at.timestamp() + shift;
                let prev = local.div_euclid(*secs) * secs - shift;
                Utc.timestamp_opt(prev, 0).single()
            }
            Rule::Fields(fields) => {
                let start = truncate_minute(self.zone.local(at));
                self.search_backward(fields, start, at)
            }
        }
    }

    /// First matching wall-clock minute from `start` that maps to an instant
    /// after `after`.
    fn search_forward(
        &self,
        fields: &Fields,
        start: NaiveDateTime,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let first_day = start.date();
        for day_offset in 0..MAX_SEARCH_DAYS {
            let date = first_day + Duration::days(day_offset);
            if !fields.day_matches(date) {
                continue;
            }
            let first = day_offset == 0;
            let hour_from = if first { start.hour() } else { 0 };
            for hour in hour_from..24 {
                if !fields.hour_matches(hour) {
                    continue;
                }
                let minute_from = if first && hour == start.hour() { start.minute() } else { 0 };
                for minute in minute_from..60 {
                    if !fields.minute_matches(minute) {
                        continue;
                    }
                    match self.to_utc(date, hour, minute) {
                        Some(t) if t > after => return Some(t),
                        _ => {}
                    }
                }
            }
        }
        None
    }

    fn search_backward(
        &self,
        fields: &Fields,
        start: NaiveDateTime,
        at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let first_day = start.date();
        for day_offset in 0..MAX_SEARCH_DAYS {
            let date = first_day - Duration::days(day_offset);
            if !fields.day_matches(date) {
                continue;
            }
            let first = day_offset == 0;
            let hour_to = if first { start.hour() } else { 23 };
            for hour in (0..=hour_to).rev() {
                if !fields.hour_matches(hour) {
                    continue;
                }
                let minute_to = if first && hour == start.hour() { start.minute() } else { 59 };
                for minute in (0..=minute_to).rev() {
                    if !fields.minute_matches(minute) {
                        continue;
                    }
                    match self.to_utc(date, hour, minute) {
                        Some(t) if t <= at => return Some(t),
                        _ => {}
                    }
                }
            }
        }
        None
    }

    fn to_utc(&self, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(hour, minute, 0)?;
        self.zone.resolve(&naive)
    }
}

fn truncate_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Parse a timezone: "UTC", "Z", "+05:30", "-0800", "UTC+2" or an IANA name
/// such as "America/New_York".
pub fn parse_timezone(timezone: &str) -> Result<Zone> {
    let tz = timezone.trim();
    if let Ok(offset) = parse_offset(tz) {
        return Ok(Zone::Fixed(offset));
    }
    tz.parse::<Tz>().map(Zone::Named).map_err(|_| {
        ReportClawError::Validation(format!(
            "unsupported timezone '{tz}' (use UTC, an offset like +02:00 or an IANA name)"
        ))
    })
}

fn parse_offset(tz: &str) -> Result<FixedOffset> {
    let invalid = || ReportClawError::Validation(format!("invalid UTC offset '{tz}'"));
    let upper = tz.to_ascii_uppercase();
    if matches!(upper.as_str(), "" | "UTC" | "Z" | "GMT" | "ETC/UTC") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }
    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    let (sign, digits) = match rest.as_bytes().first() {
        Some(b'+') => (1, &rest[1..]),
        Some(b'-') => (-1, &rest[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None => (digits, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn parse_macro(name: &str) -> Result<Rule> {
    let lower = name.trim().to_ascii_lowercase();
    let fields = match lower.as_str() {
        "yearly" | "annually" => "0 0 1 1 *",
        "monthly" => "0 0 1 * *",
        "weekly" => "0 0 * * 0",
        "daily" | "midnight" => "0 0 * * *",
        "hourly" => "0 * * * *",
        _ => {
            let Some(raw) = lower.strip_prefix("every") else {
                return Err(ReportClawError::Validation(format!("unknown cadence macro '@{name}'")));
            };
            return parse_interval(raw.trim()).map(|secs| Rule::Every { secs });
        }
    };
    parse_fields(fields).map(Rule::Fields)
}

fn parse_interval(raw: &str) -> Result<i64> {
    let invalid = || ReportClawError::Validation(format!("invalid interval '{raw}' (e.g. 15m, 2h, 1d)"));
    if raw.len() < 2 {
        return Err(invalid());
    }
    let (amount, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = amount.trim().parse().map_err(|_| invalid())?;
    let unit_secs = match unit {
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    let secs = amount.checked_mul(unit_secs).ok_or_else(invalid)?;
    if amount <= 0 || secs > 86_400 * 366 {
        return Err(invalid());
    }
    Ok(secs)
}

fn parse_fields(expression: &str) -> Result<Fields> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(ReportClawError::Validation(format!(
            "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
        )));
    }

    let mut days_of_week = parse_field(parts[4], 0, 7, &DAY_NAMES, "day-of-week")?;
    // 7 is an alias for Sunday.
    if days_of_week & (1u64 << 7) != 0 {
        days_of_week = (days_of_week & !(1u64 << 7)) | 1;
    }

    Ok(Fields {
        minutes: parse_field(parts[0], 0, 59, &[], "minute")?,
        hours: parse_field(parts[1], 0, 23, &[], "hour")?,
        days_of_month: parse_field(parts[2], 1, 31, &[], "day-of-month")?,
        months: parse_field(parts[3], 1, 12, &MONTH_NAMES, "month")?,
        days_of_week,
        dom_restricted: !parts[2].starts_with('*'),
        dow_restricted: !parts[4].starts_with('*'),
    })
}

/// Parse one field into a bit mask of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str], label: &str) -> Result<u64> {
    let invalid = |why: &str| ReportClawError::Validation(format!("invalid {label} field '{field}': {why}"));
    let mut mask = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            field_value(a, min, names)
                .zip(field_value(b, min, names))
                .ok_or_else(|| invalid("bad range"))?
        } else {
            let value = field_value(range, min, names).ok_or_else(|| invalid("bad value"))?;
            // "N/S" runs from N to the end of the field.
            if step.is_some() { (value, max) } else { (value, value) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(&format!("values must be {min}-{max} with start <= end")));
        }
        for value in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << value;
        }
    }

    if mask == 0 {
        return Err(invalid("matches nothing"));
    }
    Ok(mask)
}

/// A number, or a name from `names` (index + `base`, the field minimum).
fn field_value(token: &str, base: u32, names: &[&str]) -> Option<u32> {
    let token = token.trim();
    if let Ok(n) = token.parse::<u32>() {
        return Some(n);
    }
    let upper = token.to_ascii_uppercase();
    names
        .iter()
        .position(|name| *name == upper)
        .map(|idx| idx as u32 + base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_at_nine() {
        let cron = CronSchedule::parse("0 9 * * *", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 2, 22, 7, 0)).unwrap();
        assert_eq!(next, utc(2026, 2, 22, 9, 0));
        // Strictly after: at 09:00 the next one is tomorrow.
        let next = cron.next_after(utc(2026, 2, 22, 9, 0)).unwrap();
        assert_eq!(next, utc(2026, 2, 23, 9, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        let cron = CronSchedule::parse("*/15 * * * *", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 2, 22, 10, 2)).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_every_hour() {
        let cron = CronSchedule::parse("0 * * * *", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 2, 22, 10, 30)).unwrap();
        assert_eq!((next.hour(), next.minute()), (11, 0));
    }

    #[test]
    fn test_weekday_names_and_ranges() {
        // 2026-02-20 is a Friday.
        let cron = CronSchedule::parse("30 8 * * MON-FRI", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 2, 20, 9, 0)).unwrap();
        assert_eq!(next, utc(2026, 2, 23, 8, 30));
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn test_sunday_alias_seven() {
        let cron = CronSchedule::parse("0 0 * * 7", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 2, 20, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
    }

    #[test]
    fn test_day_fields_or_semantics() {
        // 1st of the month OR any Monday.
        let cron = CronSchedule::parse("0 0 1 * MON", "UTC").unwrap();
        assert!(cron.matches(utc(2026, 3, 1, 0, 0)));
        assert!(cron.matches(utc(2026, 3, 2, 0, 0)));
        assert!(!cron.matches(utc(2026, 3, 3, 0, 0)));
    }

    #[test]
    fn test_timezone_offset() {
        let cron = CronSchedule::parse("0 9 * * *", "+02:00").unwrap();
        let next = cron.next_after(utc(2026, 2, 22, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 2, 22, 7, 0));
        let cron = CronSchedule::parse("0 9 * * *", "UTC-5").unwrap();
        let next = cron.next_after(utc(2026, 2, 22, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 2, 22, 14, 0));
    }

    #[test]
    fn test_latest_at_or_before() {
        let cron = CronSchedule::parse("0 9 * * *", "UTC").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 22, 9, 0, 45).unwrap();
        assert_eq!(cron.latest_at_or_before(at), Some(utc(2026, 2, 22, 9, 0)));
        assert_eq!(
            cron.latest_at_or_before(utc(2026, 2, 22, 8, 59)),
            Some(utc(2026, 2, 21, 9, 0))
        );
    }

    #[test]
    fn test_leap_day() {
        let cron = CronSchedule::parse("0 12 29 2 *", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, utc(2028, 2, 29, 12, 0));
    }

    #[test]
    fn test_macros_and_intervals() {
        let daily = CronSchedule::parse("@daily", "UTC").unwrap();
        assert_eq!(daily.next_after(utc(2026, 2, 22, 10, 0)), Some(utc(2026, 2, 23, 0, 0)));

        let every = CronSchedule::parse("@every 15m", "UTC").unwrap();
        assert_eq!(every.next_after(utc(2026, 2, 22, 10, 2)), Some(utc(2026, 2, 22, 10, 15)));
        assert_eq!(
            every.latest_at_or_before(utc(2026, 2, 22, 10, 14)),
            Some(utc(2026, 2, 22, 10, 0))
        );
        assert!(every.matches(utc(2026, 2, 22, 10, 30)));
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in [
            "bad",
            "* * *",
            "60 * * * *",
            "* 24 * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "0 0 32 * *",
            "0 0 * FOO *",
            "@fortnightly",
            "@every 0m",
            "@every 5s",
            "@every 200000000000000d",
            "@every 9223372036854775807m",
        ] {
            assert!(CronSchedule::parse(bad, "UTC").is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn test_timezones() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_timezone("+25:00").is_err());
        assert_eq!(
            parse_timezone("Europe/Paris").unwrap(),
            Zone::Named(chrono_tz::Europe::Paris)
        );
        let any = utc(2026, 1, 1, 0, 0);
        assert_eq!(parse_timezone("+0530").unwrap().offset_at(any), 5 * 3600 + 30 * 60);
        assert_eq!(parse_timezone("utc").unwrap().offset_at(any), 0);
    }

    #[test]
    fn test_named_zone_follows_dst() {
        let cron = CronSchedule::parse("0 9 * * *", "Europe/Berlin").unwrap();
        // CET in winter, CEST in summer
        assert_eq!(cron.next_after(utc(2026, 1, 15, 0, 0)), Some(utc(2026, 1, 15, 8, 0)));
        assert_eq!(cron.next_after(utc(2026, 7, 15, 0, 0)), Some(utc(2026, 7, 15, 7, 0)));
        assert!(cron.matches(utc(2026, 7, 15, 7, 0)));
        assert!(!cron.matches(utc(2026, 7, 15, 8, 0)));
        assert_eq!(
            cron.latest_at_or_before(utc(2026, 7, 15, 7, 30)),
            Some(utc(2026, 7, 15, 7, 0))
        );
    }

    #[test]
    fn test_dst_gap_skips_that_day() {
        // 2026-03-29 02:00 CET jumps to 03:00 CEST, so 02:30 never happens
        let cron = CronSchedule::parse("30 2 * * *", "Europe/Berlin").unwrap();
        let next = cron.next_after(utc(2026, 3, 28, 12, 0)).unwrap();
        assert_eq!(next, utc(2026, 3, 30, 0, 30));
        assert_eq!(
            cron.latest_at_or_before(utc(2026, 3, 29, 12, 0)),
            Some(utc(2026, 3, 28, 1, 30))
        );
    }

    #[test]
    fn test_dst_overlap_fires_once() {
        // 2026-10-25 03:00 CEST falls back to 02:00 CET, 02:30 is seen twice
        let cron = CronSchedule::parse("30 2 * * *", "Europe/Berlin").unwrap();
        let first = cron.next_after(utc(2026, 10, 24, 12, 0)).unwrap();
        assert_eq!(first, utc(2026, 10, 25, 0, 30));
        assert_eq!(cron.next_after(first), Some(utc(2026, 10, 26, 1, 30)));
        // From inside the repeated hour the first pass is already behind us
        assert_eq!(
            cron.next_after(utc(2026, 10, 25, 1, 0)),
            Some(utc(2026, 10, 26, 1, 30))
        );
        assert_eq!(cron.latest_at_or_before(utc(2026, 10, 25, 1, 45)), Some(first));
    }

    #[test]
    fn test_interval_overflow_rejected() {
        let err = CronSchedule::parse("@every 200000000000000d", "UTC").unwrap_err();
        assert!(matches!(err, ReportClawError::Validation(_)));
    }
}
