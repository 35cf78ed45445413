use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use directories::ProjectDirs;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    aggregate::WindowDataset,
    analytics::{Forecast, service_shares, top_service_share},
    report::{Report, ReportView},
};

const REPORT_TEMPLATE: &str = include_str!("../assets/report.html");
const CHART_JS_VERSION: &str = "4.4.1";

#[derive(Debug, Serialize)]
pub struct ReportData {
    pub month: String,
    pub as_of: String,
    pub generated_at: String,
    pub threshold: f64,
    pub views: Vec<ViewData>,
}

#[derive(Debug, Serialize)]
pub struct ViewData {
    pub label: String,
    pub combined: bool,
    pub profiles: Vec<String>,
    pub accounts: Vec<String>,
    pub forecast: ForecastData,
    pub mtd: WindowData,
    pub ytd: WindowData,
}

#[derive(Debug, Serialize)]
pub struct WindowData {
    pub start: String,
    pub end: String,
    pub dates: Vec<String>,
    pub services: Vec<ServiceData>,
    pub daily_totals: Vec<f64>,
    pub total: f64,
    pub anomalies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_service: Option<TopService>,
}

#[derive(Debug, Serialize)]
pub struct ServiceData {
    pub name: String,
    pub total: f64,
    pub percent: f64,
    pub daily: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct TopService {
    pub name: String,
    pub total: f64,
    pub percent: f64,
}

#[derive(Debug, Serialize)]
pub struct ForecastData {
    /// "none", "complete" or "projected"
    pub status: &'static str,
    pub spent_to_date: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_average: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_in_month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_total: Option<f64>,
}

pub fn report_data(report: &Report, generated_at: String) -> ReportData {
    ReportData {
        month: report.month.format("%Y-%m").to_string(),
        as_of: format_date(report.as_of),
        generated_at,
        threshold: report.threshold,
        views: report.views.iter().map(view_data).collect(),
    }
}

fn view_data(view: &ReportView) -> ViewData {
    ViewData {
        label: view.label.clone(),
        combined: view.combined,
        profiles: view.members.iter().map(|m| m.profile.clone()).collect(),
        accounts: view.members.iter().map(|m| m.account.clone()).collect(),
        forecast: forecast_data(&view.forecast, view.mtd.total()),
        mtd: window_data(&view.mtd, &view.mtd_anomalies),
        ytd: window_data(&view.ytd, &view.ytd_anomalies),
    }
}

fn window_data(dataset: &WindowDataset, anomalies: &BTreeSet<NaiveDate>) -> WindowData {
    let shares = service_shares(dataset);
    let services = dataset
        .services
        .iter()
        .zip(shares)
        .map(|(series, share)| ServiceData {
            name: series.name.clone(),
            total: series.total,
            percent: share.percent,
            daily: dataset.dates.iter().map(|d| series.amount_on(*d)).collect(),
        })
        .collect();
    WindowData {
        start: format_date(dataset.window.start),
        end: format_date(dataset.window.end),
        dates: dataset.dates.iter().map(|d| format_date(*d)).collect(),
        services,
        daily_totals: dataset
            .dates
            .iter()
            .map(|d| dataset.daily_totals.get(d).copied().unwrap_or(0.0))
            .collect(),
        total: dataset.total(),
        anomalies: anomalies.iter().map(|d| format_date(*d)).collect(),
        top_service: top_service_share(dataset).map(|s| TopService {
            name: s.name,
            total: s.total,
            percent: s.percent,
        }),
    }
}

fn forecast_data(forecast: &Forecast, spent: f64) -> ForecastData {
    match forecast {
        Forecast::NoForecast => ForecastData {
            status: "none",
            spent_to_date: spent,
            daily_average: None,
            elapsed_days: None,
            days_in_month: None,
            forecast_total: None,
        },
        Forecast::MonthComplete { total } => ForecastData {
            status: "complete",
            spent_to_date: *total,
            daily_average: None,
            elapsed_days: None,
            days_in_month: None,
            forecast_total: None,
        },
        Forecast::Projected(p) => ForecastData {
            status: "projected",
            spent_to_date: p.spent_to_date,
            daily_average: Some(p.daily_average),
            elapsed_days: Some(p.elapsed_days),
            days_in_month: Some(p.days_in_month),
            forecast_total: Some(p.forecast_total),
        },
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Fill the bundled template with the report title, data and chart library.
pub fn render_html(data: &ReportData, chart_script: &str) -> Result<String> {
    let json = serde_json::to_string(data).context("serializing report data")?;
    let title = format!(
        "AWS cost report {} ({})",
        data.month,
        data.views
            .iter()
            .filter(|v| !v.combined)
            .map(|v| v.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let data_json = escape_script_json(&json);
    Ok(fill_template(
        REPORT_TEMPLATE,
        &[
            ("__REPORT_TITLE__", escape_html(&title).as_str()),
            ("__CHART_SCRIPT__", chart_script),
            ("__REPORT_DATA__", data_json.as_str()),
        ],
    ))
}

/// Substitutes placeholders in one left-to-right pass over `template`.
/// Inserted values are never scanned again.
fn fill_template(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = slots
            .iter()
            .filter_map(|(key, value)| rest.find(key).map(|pos| (pos, *key, *value)))
            .min_by_key(|(pos, _, _)| *pos);
        match next {
            Some((pos, key, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + key.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// Keeps a service name like "</script>" from closing the data block early.
fn escape_script_json(json: &str) -> String {
    json.replace("</", "<\\/")
}

/// Service/date matrix with a `Service,<dates...>,Total` header and a closing `Total` row.
pub fn dataset_csv(dataset: &WindowDataset) -> Result<String> {
    let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec!["Service".to_string()];
    header.extend(dataset.dates.iter().map(|d| format_date(*d)));
    header.push("Total".to_string());
    wtr.write_record(&header)?;

    for series in &dataset.services {
        let mut row = vec![series.name.clone()];
        row.extend(
            dataset
                .dates
                .iter()
                .map(|d| format_amount(series.amount_on(*d))),
        );
        row.push(format_amount(series.total));
        wtr.write_record(&row)?;
    }

    let mut totals = vec!["Total".to_string()];
    totals.extend(
        dataset
            .dates
            .iter()
            .map(|d| format_amount(dataset.daily_totals.get(d).copied().unwrap_or(0.0))),
    );
    totals.push(format_amount(dataset.total()));
    wtr.write_record(&totals)?;

    let bytes = wtr
        .into_inner()
        .map_err(|e| anyhow!("CSV writer error: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

fn format_amount(value: f64) -> String {
    format!("{:.2}", value)
}

/// `<script>` tag for Chart.js: inlined from cache or network, else a CDN include.
pub fn chart_script(offline: bool) -> String {
    if offline {
        return cdn_script_tag();
    }
    match load_chart_library() {
        Ok(source) => format!("<script>{}</script>", source.replace("</script", "<\\/script")),
        Err(err) => {
            warn!("Failed to load Chart.js ({err:#}); the report will load it from the CDN");
            cdn_script_tag()
        }
    }
}

fn chart_library_url() -> String {
    format!("https://cdn.jsdelivr.net/npm/chart.js@{CHART_JS_VERSION}/dist/chart.umd.min.js")
}

fn cdn_script_tag() -> String {
    format!("<script src=\"{}\"></script>", chart_library_url())
}

fn load_chart_library() -> Result<String> {
    if let Some(cache_path) = chart_cache_path() {
        if let Some(source) = read_chart_cache(&cache_path) {
            return Ok(source);
        }
    }
    let source = fetch_chart_library()?;
    if let Some(cache_path) = chart_cache_path() {
        if let Err(err) = save_chart_cache(&cache_path, &source) {
            debug!("not caching Chart.js: {err:#}");
        }
    }
    Ok(source)
}

/// A missing or blank cache file counts as a miss.
fn read_chart_cache(path: &Path) -> Option<String> {
    let source = std::fs::read_to_string(path).ok()?;
    if source.trim().is_empty() {
        warn!(path = %path.display(), "ignoring empty Chart.js cache");
        return None;
    }
    debug!(path = %path.display(), "using cached Chart.js");
    Some(source)
}

fn fetch_chart_library() -> Result<String> {
    let url = chart_library_url();
    let resp = ureq::get(&url)
        .timeout(Duration::from_secs(5))
        .call()
        .with_context(|| format!("fetching {url}"))?;
    let body = resp.into_string().context("reading Chart.js response")?;
    if body.trim().is_empty() {
        anyhow::bail!("empty Chart.js download");
    }
    Ok(body)
}

fn chart_cache_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "costreport", "costreport").map(|dirs| {
        dirs.cache_dir()
            .join(format!("chart-{CHART_JS_VERSION}.umd.min.js"))
    })
}

fn save_chart_cache(path: &Path, source: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating cache dir {}", parent.display()))?;
    }
    std::fs::write(path, source).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
