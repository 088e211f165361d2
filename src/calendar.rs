/// Session calendar: answers whether a UTC timestamp falls inside the LSE or
/// NYSE trading windows the setup tracker keys its state off of.
use chrono::{DateTime, NaiveTime, Timelike, Utc};

/// Abstract session calendar. A concrete implementation with fixed local-time
/// windows is the default; tests may substitute a calendar that is always
/// open or always closed.
pub trait SessionCalendar: Send + Sync {
    fn is_lse_session(&self, t: DateTime<Utc>) -> bool;
    fn is_nyse_session(&self, t: DateTime<Utc>) -> bool;
}

/// A calendar with fixed daily UTC windows: LSE runs `[lse_open, lse_close)`,
/// NYSE is considered open from `nyse_open` through the end of the UTC day.
/// Matches the 09:00-15:30 LSE / 15:30 NYSE-open-time defaults of the
/// strategy this core was built for.
#[derive(Debug, Clone)]
pub struct FixedSessionCalendar {
    pub lse_open: NaiveTime,
    pub lse_close: NaiveTime,
    pub nyse_open: NaiveTime,
}

impl Default for FixedSessionCalendar {
    fn default() -> Self {
        FixedSessionCalendar {
            lse_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            lse_close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            nyse_open: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        }
    }
}

impl SessionCalendar for FixedSessionCalendar {
    fn is_lse_session(&self, t: DateTime<Utc>) -> bool {
        let time = t.time().with_nanosecond(0).unwrap_or(t.time());
        time >= self.lse_open && time < self.lse_close
    }

    fn is_nyse_session(&self, t: DateTime<Utc>) -> bool {
        let time = t.time().with_nanosecond(0).unwrap_or(t.time());
        time >= self.nyse_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_lse_session_window() {
        let cal = FixedSessionCalendar::default();
        assert!(!cal.is_lse_session(at(8, 59)));
        assert!(cal.is_lse_session(at(9, 0)));
        assert!(cal.is_lse_session(at(15, 29)));
        assert!(!cal.is_lse_session(at(15, 30)));
    }

    #[test]
    fn test_nyse_session_window() {
        let cal = FixedSessionCalendar::default();
        assert!(!cal.is_nyse_session(at(15, 29)));
        assert!(cal.is_nyse_session(at(15, 30)));
        assert!(cal.is_nyse_session(at(23, 59)));
    }
}
