//! Durations and timestamps.
//!
//! Durations are signed nanosecond spans plus an infinity sentinel used for
//! "no timeout"/"never" semantics. Timestamps are nanoseconds since the Unix
//! epoch. Formatting and parsing are strict inverses of each other and only
//! support the documented placeholders.

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

/// Default format for timestamps: `2009-02-11T12:53:09.123Z`.
pub const DEFAULT_TIME_FORMAT: &str = "%FT%T.%3Z";

/// Default format for finite durations.
pub const DEFAULT_DURATION_FORMAT: &str = "%-%dd %T.%3%6%9";

/// Default string for infinite durations.
pub const DEFAULT_INF_DURATION_STRING: &str = "%-inf";

const NS_PER_SEC: i64 = 1_000_000_000;
const NS_PER_DAY: i64 = 86_400 * NS_PER_SEC;

/// Errors produced by time formatting, parsing and duration arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    /// A format string contains an unsupported placeholder
    #[error("Invalid time format")]
    InvalidFormat,
    /// A string does not match the format it is parsed against
    #[error("Could not parse time string")]
    ParseFailed,
    /// Adding or subtracting infinities of conflicting signs
    #[error("Infinities of conflicting signs cannot be combined")]
    ConflictingInfinities,
}

/// A signed nanosecond span or positive/negative infinity.
///
/// Arithmetic saturates to infinity on overflow. Combining infinities of
/// conflicting signs is an error.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    /// Nanosecond count; when `inf` is set only its sign is meaningful.
    ns: i64,
    inf: bool,
}

impl Duration {
    pub const ZERO: Duration = Duration { ns: 0, inf: false };

    pub const fn from_nanos(ns: i64) -> Duration {
        Duration { ns, inf: false }
    }

    pub const fn from_micros(us: i64) -> Duration {
        Duration::from_nanos(us * 1_000)
    }

    pub const fn from_millis(ms: i64) -> Duration {
        Duration::from_nanos(ms * 1_000_000)
    }

    pub const fn from_secs(s: i64) -> Duration {
        Duration::from_nanos(s * NS_PER_SEC)
    }

    /// Positive infinity.
    pub const fn inf() -> Duration {
        Duration { ns: 1, inf: true }
    }

    /// Negative infinity.
    pub const fn neg_inf() -> Duration {
        Duration { ns: -1, inf: true }
    }

    pub const fn is_inf(self) -> bool {
        self.inf
    }

    pub const fn is_neg(self) -> bool {
        self.ns < 0
    }

    pub const fn is_zero(self) -> bool {
        !self.inf && self.ns == 0
    }

    /// Nanosecond count of a finite duration, or `None` for infinities.
    pub const fn as_nanos(self) -> Option<i64> {
        if self.inf {
            None
        } else {
            Some(self.ns)
        }
    }

    /// Converts to a [`std::time::Duration`].
    ///
    /// Returns `None` for infinity and for negative spans, which makes the
    /// result directly usable as an optional timeout.
    pub fn to_std(self) -> Option<std::time::Duration> {
        if self.inf || self.ns < 0 {
            None
        } else {
            Some(std::time::Duration::from_nanos(self.ns as u64))
        }
    }

    /// Halves a finite duration; infinity stays infinity.
    pub fn halved(self) -> Duration {
        if self.inf {
            self
        } else {
            Duration::from_nanos(self.ns / 2)
        }
    }

    pub fn checked_add(self, rhs: Duration) -> Result<Duration, TimeError> {
        match (self.inf, rhs.inf) {
            (true, true) if self.is_neg() != rhs.is_neg() => Err(TimeError::ConflictingInfinities),
            (true, _) => Ok(self),
            (false, true) => Ok(rhs),
            (false, false) => Ok(self
                .ns
                .checked_add(rhs.ns)
                .map(Duration::from_nanos)
                .unwrap_or(if self.ns > 0 {
                    Duration::inf()
                } else {
                    Duration::neg_inf()
                })),
        }
    }

    pub fn checked_sub(self, rhs: Duration) -> Result<Duration, TimeError> {
        let neg = if rhs.inf {
            Duration { ns: -rhs.ns, inf: true }
        } else if rhs.ns == i64::MIN {
            Duration::inf()
        } else {
            Duration::from_nanos(-rhs.ns)
        };
        self.checked_add(neg)
    }

    /// Formats the duration.
    ///
    /// Finite durations use `durfmt` with the placeholders `%+` and `%-`
    /// (sign, always resp. only when negative), `%d` (days), `%D` (days
    /// unless zero), `%T` (shorthand for `%H:%M:%S`), `%H`, `%M`, `%S`,
    /// `%3`, `%6` and `%9`. Infinite durations use `infstr`, in which only
    /// `%+` and `%-` are substituted.
    pub fn format(self, durfmt: Option<&str>, infstr: Option<&str>) -> String {
        let sign_always = if self.is_neg() { "-" } else { "+" };
        let sign_neg = if self.is_neg() { "-" } else { "" };

        if self.inf {
            let s = infstr.unwrap_or(DEFAULT_INF_DURATION_STRING);
            return s.replace("%-", sign_neg).replace("%+", sign_always);
        }

        let s = durfmt.unwrap_or(DEFAULT_DURATION_FORMAT).to_string();
        let s = s.replace("%T", "%H:%M:%S");

        let ns = self.ns.unsigned_abs();
        let days = ns / 86_400_000_000_000;

        s.replace("%-", sign_neg)
            .replace("%+", sign_always)
            .replace("%d", &days.to_string())
            .replace("%D", &if days > 0 { days.to_string() } else { String::new() })
            .replace("%H", &format!("{:02}", (ns / 3_600_000_000_000) % 24))
            .replace("%M", &format!("{:02}", (ns / 60_000_000_000) % 60))
            .replace("%S", &format!("{:02}", (ns / NS_PER_SEC as u64) % 60))
            .replace("%3", &format!("{:03}", (ns / 1_000_000) % 1000))
            .replace("%6", &format!("{:03}", (ns / 1_000) % 1000))
            .replace("%9", &format!("{:03}", ns % 1000))
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inf {
            write!(f, "{}inf", if self.is_neg() { "-" } else { "" })
        } else {
            write!(f, "{}ns", self.ns)
        }
    }
}

/// Broken-down UTC date and time.
struct CivilTime {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

/// Days since 1970-01-01 for a civil date (proleptic Gregorian).
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = i64::from((month + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = ((mp + 2) % 12 + 1) as u32;
    (if month <= 2 { y + 1 } else { y }, month, day)
}

/// Parses exactly `width` digits and checks the allowed range.
fn parse_number(
    s: &str,
    pos: &mut usize,
    width: usize,
    min: u32,
    max: u32,
) -> Result<u32, TimeError> {
    let end = pos.checked_add(width).ok_or(TimeError::ParseFailed)?;
    let digits = s.get(*pos..end).ok_or(TimeError::ParseFailed)?;

    let mut number = 0u32;
    for ch in digits.chars() {
        let digit = ch.to_digit(10).ok_or(TimeError::ParseFailed)?;
        number = number * 10 + digit;
    }

    if number < min || number > max {
        return Err(TimeError::ParseFailed);
    }

    *pos = end;
    Ok(number)
}

fn match_char(s: &str, pos: &mut usize, ch: char) -> Result<(), TimeError> {
    let next = s.get(*pos..).and_then(|rest| rest.chars().next());
    if next != Some(ch) {
        return Err(TimeError::ParseFailed);
    }
    *pos += ch.len_utf8();
    Ok(())
}

/// A point in time, expressed as nanoseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Timestamp {
    ns_since_epoch: i64,
}

impl Timestamp {
    pub const fn from_ns_since_epoch(ns: i64) -> Timestamp {
        Timestamp { ns_since_epoch: ns }
    }

    pub const fn ns_since_epoch(self) -> i64 {
        self.ns_since_epoch
    }

    pub fn now() -> Timestamp {
        let ns = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(e) => -(e.duration().as_nanos() as i64),
        };
        Timestamp { ns_since_epoch: ns }
    }

    fn to_civil(self) -> CivilTime {
        let days = self.ns_since_epoch.div_euclid(NS_PER_DAY);
        let in_day = self.ns_since_epoch.rem_euclid(NS_PER_DAY) / NS_PER_SEC;
        let (year, month, day) = civil_from_days(days);
        CivilTime {
            year,
            month,
            day,
            hour: (in_day / 3600) as u32,
            minute: ((in_day / 60) % 60) as u32,
            second: (in_day % 60) as u32,
        }
    }

    /// Formats the timestamp in UTC.
    ///
    /// Supported placeholders: `%Y %m %d %F %H %M %S %T %3 %6 %9`. Any other
    /// `%`-escape is rejected with [`TimeError::InvalidFormat`].
    pub fn format(self, fmt: Option<&str>) -> Result<String, TimeError> {
        let fmt = fmt.unwrap_or(DEFAULT_TIME_FORMAT);
        let civil = self.to_civil();
        let sub_sec = self.ns_since_epoch.rem_euclid(NS_PER_SEC);

        let mut out = String::with_capacity(fmt.len() + 8);
        let mut special = false;
        for ch in fmt.chars() {
            if !special {
                if ch == '%' {
                    special = true;
                } else {
                    out.push(ch);
                }
                continue;
            }

            match ch {
                'Y' => out.push_str(&format!("{:04}", civil.year)),
                'm' => out.push_str(&format!("{:02}", civil.month)),
                'd' => out.push_str(&format!("{:02}", civil.day)),
                'F' => out.push_str(&format!(
                    "{:04}-{:02}-{:02}",
                    civil.year, civil.month, civil.day
                )),
                'H' => out.push_str(&format!("{:02}", civil.hour)),
                'M' => out.push_str(&format!("{:02}", civil.minute)),
                'S' => out.push_str(&format!("{:02}", civil.second)),
                'T' => out.push_str(&format!(
                    "{:02}:{:02}:{:02}",
                    civil.hour, civil.minute, civil.second
                )),
                '3' => out.push_str(&format!("{:03}", sub_sec / 1_000_000)),
                '6' => out.push_str(&format!("{:03}", (sub_sec / 1_000) % 1000)),
                '9' => out.push_str(&format!("{:03}", sub_sec % 1000)),
                _ => return Err(TimeError::InvalidFormat),
            }
            special = false;
        }

        if special {
            return Err(TimeError::InvalidFormat);
        }

        Ok(out)
    }

    /// Parses a timestamp; the strict inverse of [`Timestamp::format`].
    ///
    /// Every character of `s` must be consumed, otherwise parsing fails.
    pub fn parse(s: &str, fmt: Option<&str>) -> Result<Timestamp, TimeError> {
        let fmt = fmt.unwrap_or(DEFAULT_TIME_FORMAT);

        let mut year = 1970u32;
        let mut month = 1u32;
        let mut day = 1u32;
        let mut hour = 0u32;
        let mut minute = 0u32;
        let mut second = 0u32;
        let mut msec = 0u32;
        let mut usec = 0u32;
        let mut nsec = 0u32;

        let mut pos = 0usize;
        let mut special = false;
        for ch in fmt.chars() {
            if !special {
                if ch == '%' {
                    special = true;
                } else {
                    match_char(s, &mut pos, ch)?;
                }
                continue;
            }

            match ch {
                'Y' => year = parse_number(s, &mut pos, 4, 1970, 9999)?,
                'm' => month = parse_number(s, &mut pos, 2, 1, 12)?,
                'd' => day = parse_number(s, &mut pos, 2, 1, 31)?,
                'F' => {
                    year = parse_number(s, &mut pos, 4, 1970, 9999)?;
                    match_char(s, &mut pos, '-')?;
                    month = parse_number(s, &mut pos, 2, 1, 12)?;
                    match_char(s, &mut pos, '-')?;
                    day = parse_number(s, &mut pos, 2, 1, 31)?;
                }
                'H' => hour = parse_number(s, &mut pos, 2, 0, 23)?,
                'M' => minute = parse_number(s, &mut pos, 2, 0, 59)?,
                'S' => second = parse_number(s, &mut pos, 2, 0, 59)?,
                'T' => {
                    hour = parse_number(s, &mut pos, 2, 0, 23)?;
                    match_char(s, &mut pos, ':')?;
                    minute = parse_number(s, &mut pos, 2, 0, 59)?;
                    match_char(s, &mut pos, ':')?;
                    second = parse_number(s, &mut pos, 2, 0, 59)?;
                }
                '3' => msec = parse_number(s, &mut pos, 3, 0, 999)?,
                '6' => usec = parse_number(s, &mut pos, 3, 0, 999)?,
                '9' => nsec = parse_number(s, &mut pos, 3, 0, 999)?,
                _ => return Err(TimeError::InvalidFormat),
            }
            special = false;
        }

        if special {
            return Err(TimeError::InvalidFormat);
        }

        if pos != s.len() {
            return Err(TimeError::ParseFailed);
        }

        let days = days_from_civil(i64::from(year), month, day);
        let mut ns = days * NS_PER_DAY;
        ns += i64::from(hour) * 3600 * NS_PER_SEC;
        ns += i64::from(minute) * 60 * NS_PER_SEC;
        ns += i64::from(second) * NS_PER_SEC;
        ns += i64::from(msec) * 1_000_000;
        ns += i64::from(usec) * 1_000;
        ns += i64::from(nsec);

        Ok(Timestamp { ns_since_epoch: ns })
    }

    /// RFC 3339 with millisecond precision, e.g. `2009-02-11T12:53:09.123Z`.
    pub fn to_rfc3339_string(self) -> String {
        self.format(Some("%FT%T.%3Z"))
            .expect("built-in format is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_infinity_arithmetic() {
        let inf = Duration::inf();
        let ninf = Duration::neg_inf();
        let one = Duration::from_secs(1);

        assert_eq!(inf.checked_add(one).unwrap(), inf);
        assert_eq!(one.checked_add(inf).unwrap(), inf);
        assert_eq!(inf.checked_add(inf).unwrap(), inf);
        assert_eq!(inf.checked_sub(ninf).unwrap(), inf);
        assert_eq!(
            inf.checked_add(ninf),
            Err(TimeError::ConflictingInfinities)
        );
        assert_eq!(inf.checked_sub(inf), Err(TimeError::ConflictingInfinities));
    }

    #[test]
    fn duration_saturates_on_overflow() {
        let big = Duration::from_nanos(i64::MAX);
        assert_eq!(big.checked_add(Duration::from_nanos(1)).unwrap(), Duration::inf());

        let small = Duration::from_nanos(i64::MIN + 1);
        assert_eq!(
            small.checked_sub(Duration::from_nanos(2)).unwrap(),
            Duration::neg_inf()
        );
    }

    #[test]
    fn duration_format() {
        let dur = Duration::from_nanos(123_456_789_123_456_789);
        assert_eq!(dur.format(None, None), "1428d 21:33:09.123456789");
        assert_eq!(dur.format(Some("%S.%3"), None), "09.123");

        let neg = Duration::from_nanos(-1_500_000_000);
        assert_eq!(neg.format(Some("%-%S.%3"), None), "-01.500");
        assert_eq!(neg.format(Some("%+%S.%3"), None), "-01.500");
        assert_eq!(Duration::from_secs(1).format(Some("%+%S"), None), "+01");

        assert_eq!(Duration::inf().format(None, None), "inf");
        assert_eq!(Duration::neg_inf().format(None, None), "-inf");
        assert_eq!(Duration::inf().format(None, Some("%+forever")), "+forever");
    }

    #[test]
    fn timestamp_format() {
        let t = Timestamp::from_ns_since_epoch(1_234_356_789_123_456_789);
        assert_eq!(t.format(None).unwrap(), "2009-02-11T12:53:09.123Z");
        assert_eq!(
            t.format(Some("%Y-%m-%d %H:%M:%S.%3%6%9")).unwrap(),
            "2009-02-11 12:53:09.123456789"
        );
        assert!(t.format(Some("%x")).is_err());
    }

    #[test]
    fn timestamp_parse_is_inverse_of_format() {
        let t = Timestamp::from_ns_since_epoch(1_234_356_789_123_456_789);
        let s = t.format(Some("%FT%T.%3%6%9Z")).unwrap();
        assert_eq!(Timestamp::parse(&s, Some("%FT%T.%3%6%9Z")).unwrap(), t);
    }

    #[test]
    fn timestamp_parse_rejects_trailing_input() {
        assert_eq!(
            Timestamp::parse("2009-02-11T12:53:09.123Zx", None),
            Err(TimeError::ParseFailed)
        );
    }

    #[test]
    fn timestamp_parse_rejects_out_of_range_fields() {
        assert!(Timestamp::parse("2009-13-11T12:53:09.123Z", Some("%Y-%m-%dT%T.%3Z")).is_err());
        assert!(Timestamp::parse("2009-02-11T25:53:09.123Z", Some("%Y-%m-%dT%T.%3Z")).is_err());
    }

    #[test]
    fn civil_conversion_round_trips() {
        for &days in &[-1000i64, -1, 0, 1, 365, 10_000, 20_000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
    }
}
