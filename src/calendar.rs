//! B3 business-day resolution
//!
//! Pure date arithmetic: weekends and a fixed month-day holiday table
//! (year ignored) are skipped when walking backward from a reference date.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::HashSet;

/// Fixed national holidays plus the moveable Good Friday / Corpus Christi
/// dates observed for 2024 and 2025.
const B3_HOLIDAYS: &[(u32, u32)] = &[
    (1, 1),   // Confraternização Universal
    (3, 29),  // Sexta-feira Santa (2024)
    (4, 18),  // Sexta-feira Santa (2025)
    (4, 21),  // Tiradentes
    (5, 1),   // Dia do Trabalho
    (5, 30),  // Corpus Christi (2024)
    (6, 19),  // Corpus Christi (2025)
    (9, 7),   // Independência
    (10, 12), // Nossa Senhora Aparecida
    (11, 2),  // Finados
    (11, 15), // Proclamação da República
    (12, 25), // Natal
];

#[derive(Debug, Clone)]
pub struct HolidayCalendar {
    holidays: HashSet<(u32, u32)>,
}

impl Default for HolidayCalendar {
    fn default() -> Self {
        Self::b3()
    }
}

impl HolidayCalendar {
    pub fn b3() -> Self {
        Self {
            holidays: B3_HOLIDAYS.iter().copied().collect(),
        }
    }

    /// Adds extra `(month, day)` entries on top of the fixed table.
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = (u32, u32)>) -> Self {
        self.holidays.extend(extra);
        self
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&(date.month(), date.day()))
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    /// The `count` most recent business days at or before `reference`,
    /// newest first.
    pub fn last_business_days(&self, count: usize, reference: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(count);
        let mut date = reference;

        while days.len() < count {
            if self.is_business_day(date) {
                days.push(date);
            }
            match date.pred_opt() {
                Some(prev) => date = prev,
                None => break,
            }
        }

        days
    }
}

/// Parses a `MM-DD` holiday entry.
pub fn parse_month_day(raw: &str) -> Option<(u32, u32)> {
    let (month, day) = raw.trim().split_once('-')?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    // 2024 is a leap year so 02-29 is accepted
    NaiveDate::from_ymd_opt(2024, month, day).map(|_| (month, day))
}

/// Default walk-back start: files are published with a delay of a few days.
pub fn default_reference_date(today: NaiveDate, lag_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(lag_days))
}
