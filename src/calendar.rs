// =============================================================================
// Trading Calendar — holiday gate and session-hours lookup
// =============================================================================
//
// The annual holiday-file format and its update workflow are out of scope
// per the engine's external-collaborator boundary; this module only needs a
// minimal file-backed implementation of `is_trading_day` / `get_session_hours`
// so the orchestrator has something real to call at boot. A date listed in
// both `holidays` and `special_sessions` is treated as a special session —
// the special session overrides the holiday.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct HolidayEntry {
    date: NaiveDate,
    #[allow(dead_code)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SpecialSessionEntry {
    date: NaiveDate,
    #[allow(dead_code)]
    name: String,
    open: String,
    close: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    holidays: Vec<HolidayEntry>,
    #[serde(default)]
    special_sessions: Vec<SpecialSessionEntry>,
}

/// Session open/close, both in UTC — the caller is responsible for any
/// exchange-local wall-clock interpretation before construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHours {
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

/// File-backed trading calendar. Holds one year's holidays and special
/// sessions at a time; `calendar_dir` holds `holidays_YYYY.json` per year.
pub struct TradingCalendar {
    calendar_dir: std::path::PathBuf,
    default_open: (u32, u32),
    default_close: (u32, u32),
}

impl TradingCalendar {
    pub fn new(calendar_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            calendar_dir: calendar_dir.into(),
            default_open: (9, 15),
            default_close: (15, 30),
        }
    }

    fn load_year(&self, year: i32) -> Result<CalendarFile> {
        let path = self.calendar_dir.join(format!("holidays_{year}.json"));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read calendar file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse calendar file {}", path.display()))
    }

    /// `true` unless `date` is a weekend or a listed holiday with no
    /// overriding special session.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if is_weekend(date) {
            return false;
        }
        let file = match self.load_year(date.year()) {
            Ok(f) => f,
            Err(_) => return true, // no calendar file => assume every weekday trades
        };

        let is_special = file.special_sessions.iter().any(|s| s.date == date);
        if is_special {
            return true;
        }
        !file.holidays.iter().any(|h| h.date == date)
    }

    /// Session open/close for `date`. Returns `None` if `date` is not a
    /// trading day. Special-session hours override the standard session;
    /// otherwise the standard `09:15`-`15:30` window applies.
    pub fn get_session_hours(&self, date: NaiveDate) -> Option<SessionHours> {
        if !self.is_trading_day(date) {
            return None;
        }

        if let Ok(file) = self.load_year(date.year()) {
            if let Some(special) = file.special_sessions.iter().find(|s| s.date == date) {
                let open = parse_time_on(date, &special.open)?;
                let close = parse_time_on(date, &special.close)?;
                return Some(SessionHours { open, close });
            }
        }

        let (oh, om) = self.default_open;
        let (ch, cm) = self.default_close;
        Some(SessionHours {
            open: Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), oh, om, 0).single()?,
            close: Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), ch, cm, 0).single()?,
        })
    }

    /// Walk forward from `date` (exclusive) until the next trading day,
    /// bounded to one year to guarantee termination on a malformed
    /// calendar.
    pub fn get_next_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut candidate = date.succ_opt()?;
        for _ in 0..366 {
            if self.is_trading_day(candidate) {
                return Some(candidate);
            }
            candidate = candidate.succ_opt()?;
        }
        None
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

fn parse_time_on(date: NaiveDate, hhmm: &str) -> Option<DateTime<Utc>> {
    let mut parts = hhmm.splitn(2, ':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), h, m, 0)
        .single()
}

/// In-memory calendar used by tests that don't want to touch the filesystem.
#[derive(Default)]
pub struct StaticCalendar {
    holidays: HashMap<NaiveDate, ()>,
    special: HashMap<NaiveDate, (String, String)>,
}

impl StaticCalendar {
    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date, ());
        self
    }

    pub fn with_special_session(mut self, date: NaiveDate, open: &str, close: &str) -> Self {
        self.special.insert(date, (open.to_string(), close.to_string()));
        self
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if is_weekend(date) {
            return false;
        }
        if self.special.contains_key(&date) {
            return true;
        }
        !self.holidays.contains_key(&date)
    }

    pub fn get_session_hours(&self, date: NaiveDate) -> Option<SessionHours> {
        if !self.is_trading_day(date) {
            return None;
        }
        if let Some((open, close)) = self.special.get(&date) {
            return Some(SessionHours {
                open: parse_time_on(date, open)?,
                close: parse_time_on(date, close)?,
            });
        }
        Some(SessionHours {
            open: Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 9, 15, 0).single()?,
            close: Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 15, 30, 0).single()?,
        })
    }
}
