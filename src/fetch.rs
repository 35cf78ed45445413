use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{aggregate::CostRecord, window::Window};

const COST_METRIC: &str = "UnblendedCost";
const IDENTITY_FILE: &str = "identity.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CostAndUsageResponse {
    results_by_time: Vec<ResultByTime>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultByTime {
    time_period: TimePeriod,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TimePeriod {
    start: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Group {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    metrics: HashMap<String, MetricValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetricValue {
    amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
}

/// Where cost and identity documents come from.
#[derive(Debug, Clone)]
pub enum CostSource {
    /// Shell out to the AWS CLI once per query.
    AwsCli { program: String },
    /// Replay responses saved as `<root>/<profile>/{identity,mtd,ytd}.json`.
    Recorded { root: PathBuf },
}

impl CostSource {
    pub fn check_prerequisites(&self) -> Result<()> {
        match self {
            CostSource::AwsCli { program } => {
                let output = Command::new(program).arg("--version").output().map_err(|err| {
                    if err.kind() == ErrorKind::NotFound {
                        anyhow!(
                            "AWS CLI '{}' not found on PATH. Install it from https://aws.amazon.com/cli/ or set aws_cli in the config file.",
                            program
                        )
                    } else {
                        anyhow!("Failed to run '{} --version': {}", program, err)
                    }
                })?;
                if !output.status.success() {
                    bail!(
                        "'{} --version' exited with {}: {}",
                        program,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                debug!(
                    version = %String::from_utf8_lossy(&output.stdout).trim(),
                    "found AWS CLI"
                );
                Ok(())
            }
            CostSource::Recorded { root } => {
                if !root.is_dir() {
                    bail!("Recorded input directory {} does not exist", root.display());
                }
                Ok(())
            }
        }
    }

    /// Profile directories available under a recorded root, sorted by name.
    pub fn discover_profiles(&self) -> Result<Vec<String>> {
        let CostSource::Recorded { root } = self else {
            return Ok(Vec::new());
        };
        let mut profiles = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry =
                entry.with_context(|| format!("Failed to list {}", root.display()))?;
            if entry.file_type().is_dir() && entry.path().join(IDENTITY_FILE).is_file() {
                profiles.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(profiles)
    }

    /// Resolve the account id behind `profile`; fails when its credentials are unusable.
    pub fn account_id(&self, profile: &str) -> Result<String> {
        let raw = match self {
            CostSource::AwsCli { program } => {
                run_aws(program, profile, &["sts", "get-caller-identity"]).with_context(|| {
                    format!("Invalid or missing credentials for profile '{}'", profile)
                })?
            }
            CostSource::Recorded { root } => {
                let path = root.join(profile).join(IDENTITY_FILE);
                read_document(&path).with_context(|| {
                    format!("Invalid or missing credentials for profile '{}'", profile)
                })?
            }
        };
        let identity: CallerIdentity = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed caller identity for profile '{}'", profile))?;
        Ok(identity.account)
    }

    pub fn fetch_window(&self, profile: &str, window: &Window) -> Result<Vec<CostRecord>> {
        info!(
            profile,
            window = window.kind.as_str(),
            start = %window.start,
            end = %window.end,
            "fetching daily costs"
        );
        let records = match self {
            CostSource::AwsCli { program } => fetch_from_cli(program, profile, window)?,
            CostSource::Recorded { root } => {
                let path = root
                    .join(profile)
                    .join(format!("{}.json", window.kind.as_str()));
                let raw = read_document(&path)?;
                let page = parse_cost_response(profile, &raw)?;
                if page.next_page_token.is_some() {
                    warn!(path = %path.display(), "recorded response is paginated; only the first page is used");
                }
                page.records
            }
        };
        debug!(profile, count = records.len(), "parsed cost records");
        Ok(records)
    }
}

fn fetch_from_cli(program: &str, profile: &str, window: &Window) -> Result<Vec<CostRecord>> {
    let time_period = format!(
        "Start={},End={}",
        window.start.format("%Y-%m-%d"),
        window.query_end().format("%Y-%m-%d")
    );
    let mut records = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut args = vec![
            "ce",
            "get-cost-and-usage",
            "--time-period",
            time_period.as_str(),
            "--granularity",
            "DAILY",
            "--metrics",
            COST_METRIC,
            "--group-by",
            "Type=DIMENSION,Key=SERVICE",
        ];
        if let Some(t) = token.as_deref() {
            args.push("--next-page-token");
            args.push(t);
        }
        let raw = run_aws(program, profile, &args)
            .with_context(|| format!("Cost Explorer query failed for profile '{}'", profile))?;
        let page = parse_cost_response(profile, &raw)?;
        records.extend(page.records);
        match page.next_page_token {
            Some(next) if !next.is_empty() => {
                debug!(profile, "following Cost Explorer pagination");
                token = Some(next);
            }
            _ => break,
        }
    }
    Ok(records)
}

fn run_aws(program: &str, profile: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .args(["--profile", profile, "--output", "json"])
        .output()
        .with_context(|| format!("Failed to run {}", program))?;
    if !output.status.success() {
        bail!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8(output.stdout).with_context(|| format!("{} printed invalid UTF-8", program))
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

struct CostPage {
    records: Vec<CostRecord>,
    next_page_token: Option<String>,
}

fn parse_cost_response(profile: &str, raw: &str) -> Result<CostPage> {
    let response: CostAndUsageResponse = serde_json::from_str(raw)
        .with_context(|| format!("Malformed cost response for profile '{}'", profile))?;
    if response.results_by_time.is_empty() {
        bail!("Empty cost response for profile '{}'", profile);
    }

    let mut records = Vec::new();
    for result in response.results_by_time {
        let date = NaiveDate::parse_from_str(&result.time_period.start, "%Y-%m-%d")
            .with_context(|| {
                format!(
                    "Malformed cost response for profile '{}': bad date '{}'",
                    profile, result.time_period.start
                )
            })?;
        for group in result.groups {
            let service = group.keys.into_iter().next().ok_or_else(|| {
                anyhow!(
                    "Malformed cost response for profile '{}': group without a service key on {}",
                    profile,
                    date
                )
            })?;
            let metric = group.metrics.get(COST_METRIC).ok_or_else(|| {
                anyhow!(
                    "Malformed cost response for profile '{}': {} missing for {} on {}",
                    profile,
                    COST_METRIC,
                    service,
                    date
                )
            })?;
            let mut amount: f64 = metric.amount.trim().parse().with_context(|| {
                format!(
                    "Malformed cost response for profile '{}': amount '{}' for {} on {}",
                    profile, metric.amount, service, date
                )
            })?;
            if amount < 0.0 {
                warn!(profile, service = %service, %date, amount, "clamping negative cost to zero");
                amount = 0.0;
            }
            records.push(CostRecord {
                profile: profile.to_string(),
                service,
                date,
                amount,
            });
        }
    }

    Ok(CostPage {
        records,
        next_page_token: response.next_page_token,
    })
}
