use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Symbolic lifetime chosen at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Expiration {
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
    #[serde(rename = "6m")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
    #[default]
    #[serde(rename = "never")]
    Never,
}

impl Expiration {
    pub const ALL: [Expiration; 8] = [
        Expiration::TenMinutes,
        Expiration::OneHour,
        Expiration::OneDay,
        Expiration::OneWeek,
        Expiration::OneMonth,
        Expiration::SixMonths,
        Expiration::OneYear,
        Expiration::Never,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expiration::TenMinutes => "10m",
            Expiration::OneHour => "1h",
            Expiration::OneDay => "1d",
            Expiration::OneWeek => "1w",
            Expiration::OneMonth => "1m",
            Expiration::SixMonths => "6m",
            Expiration::OneYear => "1y",
            Expiration::Never => "never",
        }
    }

    /// Months are fixed 30-day blocks and years 365 days.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Expiration::TenMinutes => Some(Duration::minutes(10)),
            Expiration::OneHour => Some(Duration::hours(1)),
            Expiration::OneDay => Some(Duration::days(1)),
            Expiration::OneWeek => Some(Duration::days(7)),
            Expiration::OneMonth => Some(Duration::days(30)),
            Expiration::SixMonths => Some(Duration::days(180)),
            Expiration::OneYear => Some(Duration::days(365)),
            Expiration::Never => None,
        }
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|duration| now + duration)
    }
}

impl FromStr for Expiration {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let wanted = input.trim();
        Expiration::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                format!("unknown expiration {wanted:?}, expected one of 10m, 1h, 1d, 1w, 1m, 6m, 1y, never")
            })
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn current_time() -> DateTime<Utc> {
    Utc::now()
}

/// A paste is expired strictly after its expiry instant.
pub fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(at) if at < now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_every_symbolic_duration() {
        for expiration in Expiration::ALL {
            assert_eq!(expiration.as_str().parse::<Expiration>(), Ok(expiration));
        }
        assert_eq!(" 1D ".parse::<Expiration>(), Ok(Expiration::OneDay));
    }

    #[test]
    fn rejects_unknown_duration() {
        assert!("2h".parse::<Expiration>().is_err());
    }

    #[test]
    fn never_has_no_expiry_instant() {
        assert_eq!(Expiration::Never.expires_at(Utc::now()), None);
    }

    #[test]
    fn fixed_durations_match_millisecond_table() {
        assert_eq!(
            Expiration::TenMinutes.duration().map(|d| d.num_milliseconds()),
            Some(600_000)
        );
        assert_eq!(
            Expiration::OneMonth.duration().map(|d| d.num_milliseconds()),
            Some(30 * 24 * 60 * 60 * 1000)
        );
        assert_eq!(
            Expiration::OneYear.duration().map(|d| d.num_days()),
            Some(365)
        );
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ms = Duration::milliseconds(1);
        assert!(is_expired(Some(now - ms), now));
        assert!(!is_expired(Some(now + ms), now));
        assert!(!is_expired(Some(now), now));
        assert!(!is_expired(None, now));
    }

    #[test]
    fn serde_uses_symbolic_names() {
        let json = serde_json::to_string(&Expiration::SixMonths).unwrap();
        assert_eq!(json, "\"6m\"");
        let back: Expiration = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(back, Expiration::Never);
    }
}
