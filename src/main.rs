mod aggregate;
mod analytics;
mod fetch;
mod render;
mod report;
mod window;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use clap::Parser;
use colored::Colorize;
use crossterm::terminal::size as terminal_size;
use directories::ProjectDirs;
use jsonschema::{Draft, JSONSchema};
use num_format::{Locale, ToFormattedString};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    analytics::{DEFAULT_ANOMALY_THRESHOLD, Forecast, top_service_share},
    fetch::CostSource,
    render::{chart_script, dataset_csv, render_html, report_data},
    report::{ProfileInput, Report, ReportView},
    window::{Window, first_of_month, parse_month},
};

const CONFIG_FILE: &str = "costreport.json";
const DEFAULT_AWS_CLI: &str = "aws";
const DEFAULT_PROFILE: &str = "default";

#[derive(Parser, Debug)]
#[command(
    name = "costreport",
    version,
    about = "Render an interactive HTML report of AWS daily cost per service"
)]
struct Cli {
    /// Report month (YYYY-MM). Defaults to the current month in the selected timezone.
    month: Option<String>,

    /// AWS profile(s) to report on. Repeat the flag or pass a comma-separated list.
    #[arg(short, long = "profile", value_delimiter = ',')]
    profiles: Vec<String>,

    /// Replay recorded responses from DIR/<profile>/{identity,mtd,ytd}.json instead of calling AWS
    #[arg(long, value_name = "DIR")]
    input_dir: Option<PathBuf>,

    /// Directory the HTML report is written to (default: current directory)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Also write the month-to-date service/date matrix as CSV
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,

    /// Print report data as JSON instead of the summary table
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    json: Option<bool>,

    /// Treat this date (YYYY-MM-DD) as today
    #[arg(long, value_name = "DATE")]
    as_of: Option<String>,

    /// Timezone used to decide today's date (IANA name, e.g. UTC, Europe/Berlin)
    #[arg(long)]
    timezone: Option<String>,

    /// Standard deviations above the mean that mark a day as anomalous (default 2.0)
    #[arg(long)]
    threshold: Option<f64>,

    /// Do not download Chart.js; the report references the CDN instead
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    offline: Option<bool>,

    /// Optional config file (JSON). If omitted, tries ./costreport.json then the user config dir
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Default, Deserialize)]
struct FileConfig {
    profiles: Option<Vec<String>>,
    timezone: Option<String>,
    output_dir: Option<PathBuf>,
    threshold: Option<f64>,
    offline: Option<bool>,
    json: Option<bool>,
    aws_cli: Option<String>,
}

static CONFIG_SCHEMA: OnceCell<JSONSchema> = OnceCell::new();
static CONFIG_SCHEMA_JSON: OnceCell<Value> = OnceCell::new();

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let file_cfg = load_config(cli.config.as_ref())?;

    let tz = parse_timezone(resolve_string(
        cli.timezone.as_ref(),
        file_cfg.timezone.as_ref(),
    ))?;
    let today = match parse_date_opt(cli.as_of.as_deref())? {
        Some(date) => date,
        None => Utc::now().with_timezone(&tz).date_naive(),
    };
    let month = match cli.month.as_deref() {
        Some(raw) => parse_month(raw)?,
        None => first_of_month(today),
    };
    let mtd_window = Window::month_to_date(month, today)?;
    let ytd_window = Window::year_to_date(month, today)?;

    let threshold = resolve_threshold(cli.threshold, file_cfg.threshold)?;
    let offline = resolve_bool(cli.offline, file_cfg.offline, false);
    let json = resolve_bool(cli.json, file_cfg.json, false);
    let output_dir = cli
        .output_dir
        .clone()
        .or_else(|| file_cfg.output_dir.clone())
        .map(|p| expand_tilde(&p))
        .unwrap_or_else(|| PathBuf::from("."));

    let source = match &cli.input_dir {
        Some(dir) => CostSource::Recorded {
            root: expand_tilde(dir),
        },
        None => CostSource::AwsCli {
            program: file_cfg
                .aws_cli
                .clone()
                .unwrap_or_else(|| DEFAULT_AWS_CLI.to_string()),
        },
    };
    source.check_prerequisites()?;
    let profiles = resolve_profiles(&cli.profiles, file_cfg.profiles.as_ref(), &source)?;
    info!(
        month = %month.format("%Y-%m"),
        as_of = %today,
        profiles = %profiles.join(","),
        "building cost report"
    );

    let mut inputs = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let account = source.account_id(&profile)?;
        let mtd = source.fetch_window(&profile, &mtd_window)?;
        let ytd = source.fetch_window(&profile, &ytd_window)?;
        inputs.push(ProfileInput {
            profile,
            account,
            mtd,
            ytd,
        });
    }

    let report = Report::build(month, today, mtd_window, ytd_window, threshold, inputs)?;
    let generated_at = Utc::now()
        .with_timezone(&tz)
        .format("%Y-%m-%d %H:%M %Z")
        .to_string();
    let data = report_data(&report, generated_at);
    let html = render_html(&data, &chart_script(offline))?;

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output dir {}", output_dir.display()))?;
    let report_path = output_dir.join(report.file_name());
    std::fs::write(&report_path, html)
        .with_context(|| format!("Failed to write report {}", report_path.display()))?;
    info!(path = %report_path.display(), "wrote report");

    if let Some(csv_path) = &cli.csv {
        let csv = dataset_csv(&report.primary_view().mtd)?;
        std::fs::write(csv_path, csv)
            .with_context(|| format!("Failed to write CSV {}", csv_path.display()))?;
        info!(path = %csv_path.display(), "wrote CSV");
    }

    if json {
        serde_json::to_writer_pretty(std::io::stdout(), &data).context("writing JSON output")?;
        println!();
    } else {
        print_summary(&report, &report_path);
    }

    Ok(())
}

fn init_logging(raw: &str) -> Result<()> {
    let level = match raw.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => {
            return Err(anyhow!(
                "Invalid log level '{}'. Use trace, debug, info, warn or error",
                other
            ));
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing log subscriber")?;
    Ok(())
}

/// CLI, then config file, then recorded profile directories, then `AWS_PROFILE`, then `default`.
fn resolve_profiles(
    cli: &[String],
    config: Option<&Vec<String>>,
    source: &CostSource,
) -> Result<Vec<String>> {
    let mut profiles: Vec<String> = cli
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if profiles.is_empty() {
        if let Some(cfg) = config {
            profiles = cfg.clone();
        }
    }
    if profiles.is_empty() {
        profiles = source.discover_profiles()?;
    }
    if profiles.is_empty() {
        profiles.push(
            std::env::var("AWS_PROFILE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
        );
    }

    let mut unique: Vec<String> = Vec::with_capacity(profiles.len());
    for profile in profiles {
        if !unique.contains(&profile) {
            unique.push(profile);
        }
    }
    Ok(unique)
}

fn resolve_threshold(cli: Option<f64>, config: Option<f64>) -> Result<f64> {
    let threshold = cli.or(config).unwrap_or(DEFAULT_ANOMALY_THRESHOLD);
    if !threshold.is_finite() || threshold <= 0.0 {
        anyhow::bail!("Anomaly threshold must be a positive number, got {}", threshold);
    }
    Ok(threshold)
}

fn resolve_bool(cli: Option<bool>, config: Option<bool>, fallback: bool) -> bool {
    cli.or(config).unwrap_or(fallback)
}

fn resolve_string(cli: Option<&String>, config: Option<&String>) -> Option<String> {
    cli.cloned().or_else(|| config.cloned())
}

fn load_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    let candidate = if let Some(p) = path {
        Some(p.clone())
    } else {
        let cwd = PathBuf::from(CONFIG_FILE);
        if cwd.exists() {
            Some(cwd)
        } else {
            ProjectDirs::from("com", "costreport", "costreport")
                .map(|dirs| dirs.config_dir().join("config.json"))
                .filter(|p| p.exists())
        }
    };

    if let Some(path) = candidate {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        validate_config(&value)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        let cfg: FileConfig = serde_json::from_value(value)
            .with_context(|| format!("Failed to deserialize config file {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Ok(cfg)
    } else {
        Ok(FileConfig::default())
    }
}

fn validate_config(value: &Value) -> Result<()> {
    let schema_value = CONFIG_SCHEMA_JSON.get_or_try_init(|| {
        let schema_str = include_str!("../config-schema.json");
        serde_json::from_str(schema_str).context("parsing config schema")
    })?;
    let schema = CONFIG_SCHEMA.get_or_try_init(|| {
        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema_value)
            .map_err(|err| anyhow!("compiling config schema: {}", err))
    })?;

    let problems: Vec<String> = match schema.validate(value) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|err| {
                let at = err.instance_path.to_string();
                if at.is_empty() {
                    format!("  {err}")
                } else {
                    format!("  {at}: {err}")
                }
            })
            .collect(),
    };
    Err(anyhow!(
        "costreport config validation failed:\n{}",
        problems.join("\n")
    ))
}

fn parse_timezone(raw: Option<String>) -> Result<Tz> {
    let Some(name) = raw else {
        return Ok(chrono_tz::UTC);
    };
    name.parse::<Tz>()
        .map_err(|e| anyhow!("Unknown timezone '{name}' ({e}); use an IANA name such as Europe/Berlin"))
}

fn parse_date_opt(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("--as-of '{s}' is not a YYYY-MM-DD date"))
    })
    .transpose()
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(rest) = path_str.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
                return home.join(rest);
            }
        }
    }
    path.to_path_buf()
}

fn print_summary(report: &Report, path: &Path) {
    let term_width = get_terminal_width();
    let use_compact = term_width < 110;

    println!(
        "{}",
        format!("AWS cost report {}", report.month.format("%Y-%m")).bold()
    );

    let headers = if use_compact {
        vec!["View", "MTD", "YTD", "Forecast", "Spikes"]
    } else {
        vec!["View", "Account", "MTD", "YTD", "Forecast", "Top service", "Spikes"]
    };
    let mut table = SimpleTable::new(headers)
        .header_style(|s| s.cyan().bold())
        .footer_style(|s| s.yellow());
    for view in report.profile_views() {
        table.add_row(summary_cells(view, use_compact));
    }
    if let Some(combined) = report.views.iter().find(|v| v.combined) {
        table.set_footer(summary_cells(combined, use_compact));
    }
    table.print();

    let primary = report.primary_view();
    if !primary.mtd_anomalies.is_empty() {
        let days: Vec<String> = primary
            .mtd_anomalies
            .iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect();
        println!(
            "{} {}",
            "Cost spikes:".red().bold(),
            days.join(", ")
        );
    }
    println!("{} {}", "Report written to".green(), path.display());
}

fn summary_cells(view: &ReportView, compact: bool) -> Vec<String> {
    let label = truncate_str(&view.label, 24);
    let mtd = format_cost(view.mtd.total());
    let ytd = format_cost(view.ytd.total());
    let forecast = format_forecast(&view.forecast);
    let spikes = match view.mtd_anomalies.len() {
        0 => "-".to_string(),
        n => n.to_string(),
    };
    if compact {
        return vec![label, mtd, ytd, forecast, spikes];
    }
    let top = top_service_share(&view.mtd)
        .map(|s| format!("{} ({:.1}%)", truncate_str(&s.name, 32), s.percent))
        .unwrap_or_else(|| "-".into());
    let accounts = view.accounts();
    let account = if accounts.len() > 2 {
        format!("{} accounts", accounts.len())
    } else {
        accounts.join(", ")
    };
    vec![label, account, mtd, ytd, forecast, top, spikes]
}

fn format_forecast(forecast: &Forecast) -> String {
    match forecast {
        Forecast::NoForecast => "-".into(),
        Forecast::MonthComplete { .. } => "complete".into(),
        Forecast::Projected(p) => format_cost(p.forecast_total),
    }
}

fn format_cost(value: f64) -> String {
    let cents = (value * 100.0).round() as u64;
    format!(
        "${}.{:02}",
        (cents / 100).to_formatted_string(&Locale::en),
        cents % 100
    )
}

/// Get terminal width, defaulting to 120 if unavailable
fn get_terminal_width() -> u16 {
    terminal_size().map(|(w, _)| w).unwrap_or(120)
}

/// Truncate a string to max length, adding "..." if needed
fn truncate_str(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        s.to_string()
    } else if max_len > 3 {
        format!("{}...", s.chars().take(max_len - 3).collect::<String>())
    } else {
        s.chars().take(max_len).collect()
    }
}

/// Box-drawn table. Cells are plain text; styles are applied after padding.
struct SimpleTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    header_style: Option<fn(&str) -> colored::ColoredString>,
    footer_style: Option<fn(&str) -> colored::ColoredString>,
    footer: Option<Vec<String>>,
}

impl SimpleTable {
    fn new(headers: Vec<&str>) -> Self {
        Self {
            headers: headers.into_iter().map(String::from).collect(),
            rows: Vec::new(),
            header_style: None,
            footer_style: None,
            footer: None,
        }
    }

    fn header_style(mut self, f: fn(&str) -> colored::ColoredString) -> Self {
        self.header_style = Some(f);
        self
    }

    fn footer_style(mut self, f: fn(&str) -> colored::ColoredString) -> Self {
        self.footer_style = Some(f);
        self
    }

    fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn set_footer(&mut self, footer: Vec<String>) {
        self.footer = Some(footer);
    }

    fn column_widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in self.rows.iter().chain(self.footer.iter()) {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        widths
    }

    fn print(&self) {
        let widths = self.column_widths();

        print_border(&widths, '┌', '┬', '┐');
        print_cells(&self.headers, &widths, self.header_style);
        print_border(&widths, '├', '┼', '┤');
        for row in &self.rows {
            print_cells(row, &widths, None);
        }
        if let Some(ref footer) = self.footer {
            print_border(&widths, '├', '┼', '┤');
            print_cells(footer, &widths, self.footer_style);
        }
        print_border(&widths, '└', '┴', '┘');
    }
}

fn print_border(widths: &[usize], left: char, mid: char, right: char) {
    let parts: Vec<String> = widths.iter().map(|w| "─".repeat(*w + 2)).collect();
    println!("{}{}{}", left, parts.join(mid.to_string().as_str()), right);
}

fn print_cells(
    row: &[String],
    widths: &[usize],
    style: Option<fn(&str) -> colored::ColoredString>,
) {
    print!("│");
    for (cell, width) in row.iter().zip(widths) {
        let padded = format!("{:width$}", cell, width = *width);
        match style {
            Some(style) => print!(" {} │", style(&padded)),
            None => print!(" {} │", padded),
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_errors_name_the_tool_and_the_field() {
        let err = validate_config(&json!({"threshold": 0, "colour": "blue"})).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("costreport config validation failed:"));
        assert!(msg.contains("/threshold"));
        assert!(validate_config(&json!({"profiles": ["dev"], "json": true})).is_ok());
    }

    #[test]
    fn timezone_defaults_to_utc() {
        assert_eq!(parse_timezone(None).unwrap(), chrono_tz::UTC);
        assert_eq!(
            parse_timezone(Some("Europe/Berlin".into())).unwrap(),
            chrono_tz::Europe::Berlin
        );
        assert!(parse_timezone(Some("Mars/Olympus".into())).is_err());
    }

    #[test]
    fn as_of_must_be_a_calendar_date() {
        assert_eq!(parse_date_opt(None).unwrap(), None);
        assert_eq!(
            parse_date_opt(Some("2026-03-10")).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 10)
        );
        assert!(parse_date_opt(Some("2026-02-30")).is_err());
    }

    #[test]
    fn column_widths_ignore_footer_styling() {
        let mut table = SimpleTable::new(vec!["View", "MTD"]).footer_style(|s| s.yellow());
        table.add_row(vec!["alpha".into(), "$200.00".into()]);
        table.set_footer(vec!["All profiles".into(), "$1,275.00".into()]);
        assert_eq!(table.column_widths(), vec![12, 9]);
    }

    #[test]
    fn costs_use_thousands_separators() {
        assert_eq!(format_cost(1275.0), "$1,275.00");
        assert_eq!(format_cost(0.125), "$0.13");
    }
}
