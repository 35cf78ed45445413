use std::collections::BTreeSet;

use anyhow::{Result, bail};
use chrono::NaiveDate;

use crate::{
    aggregate::{CostRecord, WindowDataset, aggregate_window, combine},
    analytics::{Forecast, detect_anomalies, forecast_month},
    window::Window,
};

pub const COMBINED_LABEL: &str = "All profiles";

/// Everything fetched for one profile.
#[derive(Debug, Clone)]
pub struct ProfileInput {
    pub profile: String,
    pub account: String,
    pub mtd: Vec<CostRecord>,
    pub ytd: Vec<CostRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub profile: String,
    pub account: String,
}

#[derive(Debug, Clone)]
pub struct ReportView {
    pub label: String,
    pub combined: bool,
    pub members: Vec<Member>,
    pub mtd: WindowDataset,
    pub ytd: WindowDataset,
    pub forecast: Forecast,
    pub mtd_anomalies: BTreeSet<NaiveDate>,
    pub ytd_anomalies: BTreeSet<NaiveDate>,
}

impl ReportView {
    fn new(
        label: String,
        combined: bool,
        members: Vec<Member>,
        mtd: WindowDataset,
        ytd: WindowDataset,
        threshold: f64,
    ) -> Self {
        let forecast = forecast_month(&mtd.dates, &mtd.daily_totals);
        let mtd_anomalies = detect_anomalies(&mtd.daily_totals, threshold);
        let ytd_anomalies = detect_anomalies(&ytd.daily_totals, threshold);
        ReportView {
            label,
            combined,
            members,
            mtd,
            ytd,
            forecast,
            mtd_anomalies,
            ytd_anomalies,
        }
    }

    pub fn accounts(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.account.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub month: NaiveDate,
    pub as_of: NaiveDate,
    pub threshold: f64,
    pub views: Vec<ReportView>,
}

impl Report {
    /// One view per profile in input order, plus a combined view when there are several.
    pub fn build(
        month: NaiveDate,
        as_of: NaiveDate,
        mtd_window: Window,
        ytd_window: Window,
        threshold: f64,
        inputs: Vec<ProfileInput>,
    ) -> Result<Self> {
        if inputs.is_empty() {
            bail!("No profiles to report on");
        }

        let mut views: Vec<ReportView> = inputs
            .into_iter()
            .map(|input| {
                let mtd = aggregate_window(&input.mtd, mtd_window);
                let ytd = aggregate_window(&input.ytd, ytd_window);
                ReportView::new(
                    input.profile.clone(),
                    false,
                    vec![Member {
                        profile: input.profile,
                        account: input.account,
                    }],
                    mtd,
                    ytd,
                    threshold,
                )
            })
            .collect();

        if views.len() > 1 {
            let mtd = combine(mtd_window, views.iter().map(|v| &v.mtd));
            let ytd = combine(ytd_window, views.iter().map(|v| &v.ytd));
            let members = views.iter().flat_map(|v| v.members.clone()).collect();
            views.push(ReportView::new(
                COMBINED_LABEL.to_string(),
                true,
                members,
                mtd,
                ytd,
                threshold,
            ));
        }

        Ok(Report {
            month,
            as_of,
            threshold,
            views,
        })
    }

    /// The combined view when present, otherwise the only profile.
    pub fn primary_view(&self) -> &ReportView {
        self.views
            .iter()
            .find(|v| v.combined)
            .unwrap_or(&self.views[0])
    }

    pub fn profile_views(&self) -> impl Iterator<Item = &ReportView> {
        self.views.iter().filter(|v| !v.combined)
    }

    /// `cost-report-<YYYY-MM>-<profile>-<account>[__<profile>-<account>...].html`
    pub fn file_name(&self) -> String {
        let parts: Vec<String> = self
            .profile_views()
            .flat_map(|v| v.members.iter())
            .map(|m| format!("{}-{}", sanitize_file_part(&m.profile), sanitize_file_part(&m.account)))
            .collect();
        format!(
            "cost-report-{}-{}.html",
            self.month.format("%Y-%m"),
            parts.join("__")
        )
    }
}

fn sanitize_file_part(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
