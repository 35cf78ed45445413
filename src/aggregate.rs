use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};

use chrono::NaiveDate;
use tracing::debug;

use crate::window::Window;

/// One day of one service's cost, as reported for a single profile.
#[derive(Debug, Clone, PartialEq)]
pub struct CostRecord {
    pub profile: String,
    pub service: String,
    pub date: NaiveDate,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSeries {
    pub name: String,
    pub total: f64,
    pub daily: BTreeMap<NaiveDate, f64>,
}

impl ServiceSeries {
    pub fn amount_on(&self, date: NaiveDate) -> f64 {
        self.daily.get(&date).copied().unwrap_or(0.0)
    }
}

/// Services (filtered, sorted by total descending) and daily totals for one window.
#[derive(Debug, Clone)]
pub struct WindowDataset {
    pub window: Window,
    pub dates: Vec<NaiveDate>,
    pub services: Vec<ServiceSeries>,
    pub daily_totals: BTreeMap<NaiveDate, f64>,
}

impl WindowDataset {
    pub fn total(&self) -> f64 {
        self.services.iter().map(|s| s.total).sum()
    }

    pub fn top_service(&self) -> Option<&ServiceSeries> {
        self.services.first()
    }
}

#[derive(Default)]
struct SeriesAccumulator {
    name: String,
    daily: BTreeMap<NaiveDate, f64>,
}

impl SeriesAccumulator {
    fn new(name: String) -> Self {
        SeriesAccumulator {
            name,
            ..Default::default()
        }
    }

    fn add(&mut self, date: NaiveDate, amount: f64) {
        *self.daily.entry(date).or_insert(0.0) += amount;
    }

    fn finish(self) -> ServiceSeries {
        let total = self.daily.values().sum();
        ServiceSeries {
            name: self.name,
            total,
            daily: self.daily,
        }
    }
}

/// Accumulators in first-seen order, so the stable sort can break ties by encounter.
#[derive(Default)]
struct ServiceTable {
    order: Vec<SeriesAccumulator>,
    index: HashMap<String, usize>,
}

impl ServiceTable {
    fn entry(&mut self, service: &str) -> &mut SeriesAccumulator {
        let idx = match self.index.get(service).copied() {
            Some(idx) => idx,
            None => {
                self.order.push(SeriesAccumulator::new(service.to_string()));
                self.index.insert(service.to_string(), self.order.len() - 1);
                self.order.len() - 1
            }
        };
        &mut self.order[idx]
    }

    fn finish(self, window: Window) -> WindowDataset {
        let dates = window.dates();
        let mut services: Vec<ServiceSeries> = self
            .order
            .into_iter()
            .map(SeriesAccumulator::finish)
            .filter(|s| s.total != 0.0)
            .collect();
        sort_services(&mut services);

        let mut daily_totals: BTreeMap<NaiveDate, f64> =
            dates.iter().map(|d| (*d, 0.0)).collect();
        for series in &services {
            for (date, amount) in &series.daily {
                if let Some(total) = daily_totals.get_mut(date) {
                    *total += amount;
                }
            }
        }

        WindowDataset {
            window,
            dates,
            services,
            daily_totals,
        }
    }
}

/// Fold raw records into per-service series for `window`, dropping zero-cost services.
pub fn aggregate_window(records: &[CostRecord], window: Window) -> WindowDataset {
    let mut table = ServiceTable::default();
    for record in records {
        if !window.contains(record.date) {
            debug!(
                profile = %record.profile,
                service = %record.service,
                date = %record.date,
                "skipping record outside {} window",
                window.kind.as_str()
            );
            continue;
        }
        table.entry(&record.service).add(record.date, record.amount);
    }
    table.finish(window)
}

/// Sum several datasets of the same window per (service, date).
pub fn combine<'a, I>(window: Window, datasets: I) -> WindowDataset
where
    I: IntoIterator<Item = &'a WindowDataset>,
{
    let mut table = ServiceTable::default();
    for dataset in datasets {
        for series in &dataset.services {
            let acc = table.entry(&series.name);
            for (date, amount) in &series.daily {
                if window.contains(*date) {
                    acc.add(*date, *amount);
                }
            }
        }
    }
    table.finish(window)
}

fn sort_services(services: &mut [ServiceSeries]) {
    services.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(Ordering::Equal));
}
