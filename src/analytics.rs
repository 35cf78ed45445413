use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::{aggregate::WindowDataset, window::days_in_month};

pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Forecast {
    /// Fewer than two elapsed days.
    NoForecast,
    MonthComplete { total: f64 },
    Projected(Projection),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub spent_to_date: f64,
    pub daily_average: f64,
    pub elapsed_days: u32,
    pub days_in_month: u32,
    pub forecast_total: f64,
}

/// Linear end-of-month projection: average elapsed daily cost times the month length.
pub fn forecast_month(dates: &[NaiveDate], daily_totals: &BTreeMap<NaiveDate, f64>) -> Forecast {
    let Some(first) = dates.first() else {
        return Forecast::NoForecast;
    };
    if dates.len() < 2 {
        return Forecast::NoForecast;
    }

    let spent_to_date: f64 = dates
        .iter()
        .map(|d| daily_totals.get(d).copied().unwrap_or(0.0))
        .sum();
    let elapsed_days = dates.len() as u32;
    let month_days = days_in_month(*first);
    if elapsed_days >= month_days {
        return Forecast::MonthComplete {
            total: spent_to_date,
        };
    }

    let daily_average = spent_to_date / elapsed_days as f64;
    Forecast::Projected(Projection {
        spent_to_date,
        daily_average,
        elapsed_days,
        days_in_month: month_days,
        forecast_total: daily_average * month_days as f64,
    })
}

/// Dates whose amount is a spike of at least `threshold` population standard deviations.
pub fn detect_anomalies(
    daily_totals: &BTreeMap<NaiveDate, f64>,
    threshold: f64,
) -> BTreeSet<NaiveDate> {
    if daily_totals.len() < 3 {
        return BTreeSet::new();
    }
    let values: Vec<f64> = daily_totals.values().copied().collect();
    let avg = mean(&values);
    let cutoff = avg + threshold * population_std_dev(&values, avg);

    daily_totals
        .iter()
        .filter(|(_, amount)| **amount >= cutoff && **amount > avg)
        .map(|(date, _)| *date)
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

pub fn percentage_of(part: f64, total: f64) -> f64 {
    if total == 0.0 {
        return 0.0;
    }
    part / total * 100.0
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceShare {
    pub name: String,
    pub total: f64,
    pub percent: f64,
}

/// Percentage of the window total for every service, in ranking order.
pub fn service_shares(dataset: &WindowDataset) -> Vec<ServiceShare> {
    let grand_total = dataset.total();
    dataset
        .services
        .iter()
        .map(|s| ServiceShare {
            name: s.name.clone(),
            total: s.total,
            percent: round_one_decimal(percentage_of(s.total, grand_total)),
        })
        .collect()
}

pub fn top_service_share(dataset: &WindowDataset) -> Option<ServiceShare> {
    let grand_total = dataset.total();
    dataset.top_service().map(|s| ServiceShare {
        name: s.name.clone(),
        total: s.total,
        percent: round_one_decimal(percentage_of(s.total, grand_total)),
    })
}
