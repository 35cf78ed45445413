use anyhow::{Context, Result, bail};
use chrono::{Datelike, Duration as ChronoDuration, Months, NaiveDate};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowKind {
    Mtd,
    Ytd,
}

impl WindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowKind::Mtd => "mtd",
            WindowKind::Ytd => "ytd",
        }
    }
}

/// Inclusive range of calendar days a report covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub kind: WindowKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    /// First day of `month` through the end of that month, capped at `today`.
    pub fn month_to_date(month: NaiveDate, today: NaiveDate) -> Result<Self> {
        let start = first_of_month(month);
        if start > today {
            bail!(
                "Report month {} has not started yet (today is {})",
                start.format("%Y-%m"),
                today.format("%Y-%m-%d")
            );
        }
        Ok(Window {
            kind: WindowKind::Mtd,
            start,
            end: last_of_month(start).min(today),
        })
    }

    /// January 1 of the report year through the same end as the MTD window.
    pub fn year_to_date(month: NaiveDate, today: NaiveDate) -> Result<Self> {
        let mtd = Self::month_to_date(month, today)?;
        let start = NaiveDate::from_ymd_opt(mtd.start.year(), 1, 1)
            .with_context(|| format!("No January 1 for year {}", mtd.start.year()))?;
        Ok(Window {
            kind: WindowKind::Ytd,
            start,
            end: mtd.end,
        })
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .collect()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Exclusive end date expected by the billing API.
    pub fn query_end(&self) -> NaiveDate {
        self.end + ChronoDuration::days(1)
    }
}

pub fn parse_month(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d")
        .with_context(|| format!("Could not parse month '{}', expected YYYY-MM", raw))
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - ChronoDuration::days(date.day0() as i64)
}

pub fn last_of_month(date: NaiveDate) -> NaiveDate {
    let start = first_of_month(date);
    start
        .checked_add_months(Months::new(1))
        .map(|next| next - ChronoDuration::days(1))
        .unwrap_or(NaiveDate::MAX)
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    last_of_month(date).day()
}
