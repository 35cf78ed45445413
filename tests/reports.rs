use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::process::Command;
use tempfile::TempDir;

const ACCOUNTS: &str = "tests/fixtures/accounts";
const ERRORS: &str = "tests/fixtures/errors";

fn costreport(out: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("costreport"));
    cmd.env_remove("AWS_PROFILE")
        .env_remove("RUST_LOG")
        .args(["--offline", "--as-of", "2026-03-10", "--output-dir"])
        .arg(out.path());
    cmd
}

fn run_json(args: &[&str]) -> (Value, TempDir) {
    let out = TempDir::new().unwrap();
    let output = costreport(&out)
        .args(args)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v = serde_json::from_slice(&output).expect("valid json output");
    (v, out)
}

fn service_names(window: &Value) -> Vec<String> {
    window["services"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn discovers_profiles_and_builds_combined_view() {
    let (v, _out) = run_json(&["--input-dir", ACCOUNTS]);
    assert_eq!(v["month"], "2026-03");
    let views = v["views"].as_array().unwrap();
    assert_eq!(views.len(), 3);
    assert_eq!(views[0]["label"], "alpha");
    assert_eq!(views[1]["label"], "beta-prod.eu");
    assert_eq!(views[2]["combined"], json!(true));
    assert_eq!(
        views[2]["accounts"],
        json!(["111111111111", "222222222222"])
    );
}

#[test]
fn month_to_date_matches_fixture() {
    let (v, _out) = run_json(&["--input-dir", ACCOUNTS, "--profile", "alpha"]);
    let views = v["views"].as_array().unwrap();
    assert_eq!(views.len(), 1);
    let mtd = &views[0]["mtd"];
    assert_eq!(mtd["start"], "2026-03-01");
    assert_eq!(mtd["end"], "2026-03-10");
    assert_eq!(mtd["dates"].as_array().unwrap().len(), 10);
    assert_eq!(mtd["total"], json!(200.0));
    // AWS Lambda only ever reports 0.00 and is filtered out
    assert_eq!(
        service_names(mtd),
        vec![
            "Amazon Elastic Compute Cloud - Compute",
            "AmazonCloudWatch",
            "Amazon Simple Storage Service"
        ]
    );
    assert_eq!(mtd["services"][0]["total"], json!(100.0));
    assert_eq!(mtd["services"][0]["percent"], json!(50.0));
    assert_eq!(mtd["top_service"]["percent"], json!(50.0));
    assert_eq!(mtd["anomalies"], json!(["2026-03-09"]));

    let totals: f64 = mtd["daily_totals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_f64().unwrap())
        .sum();
    assert!((totals - 200.0).abs() < 1e-9);
}

#[test]
fn forecast_projects_to_month_end() {
    let (v, _out) = run_json(&["--input-dir", ACCOUNTS, "-p", "alpha,beta-prod.eu"]);
    let views = v["views"].as_array().unwrap();
    assert_eq!(views[0]["forecast"]["status"], "projected");
    assert_eq!(views[0]["forecast"]["elapsed_days"], json!(10));
    assert_eq!(views[0]["forecast"]["days_in_month"], json!(31));
    assert_eq!(views[0]["forecast"]["forecast_total"], json!(620.0));
    assert_eq!(views[1]["forecast"]["forecast_total"], json!(232.5));
    assert_eq!(views[2]["forecast"]["forecast_total"], json!(852.5));
}

#[test]
fn combined_view_sums_profiles() {
    let (v, _out) = run_json(&[
        "--input-dir",
        ACCOUNTS,
        "--profile",
        "alpha",
        "--profile",
        "beta-prod.eu",
    ]);
    let combined = &v["views"][2];
    assert_eq!(combined["label"], "All profiles");
    assert_eq!(combined["mtd"]["total"], json!(275.0));
    assert_eq!(combined["ytd"]["total"], json!(895.0));
    assert_eq!(
        service_names(&combined["mtd"]),
        vec![
            "Amazon Elastic Compute Cloud - Compute",
            "AmazonCloudWatch",
            "Amazon Relational Database Service",
            "Amazon Simple Storage Service"
        ]
    );
    assert_eq!(combined["mtd"]["services"][0]["daily"][0], json!(15.0));
    assert_eq!(combined["mtd"]["anomalies"], json!(["2026-03-09"]));
}

#[test]
fn year_to_date_covers_january_through_as_of() {
    let (v, _out) = run_json(&["--input-dir", ACCOUNTS, "--profile", "beta-prod.eu"]);
    let ytd = &v["views"][0]["ytd"];
    assert_eq!(ytd["start"], "2026-01-01");
    assert_eq!(ytd["end"], "2026-03-10");
    assert_eq!(ytd["dates"].as_array().unwrap().len(), 69);
    assert_eq!(ytd["total"], json!(115.0));
    assert_eq!(
        service_names(ytd),
        vec![
            "Amazon Relational Database Service",
            "Amazon Elastic Compute Cloud - Compute"
        ]
    );
    assert_eq!(v["views"][0]["mtd"]["anomalies"], json!([]));
}

#[test]
fn past_month_reports_complete() {
    let (v, _out) = run_json(&["2026-02", "--input-dir", ACCOUNTS, "--profile", "alpha"]);
    assert_eq!(v["month"], "2026-02");
    let view = &v["views"][0];
    assert_eq!(view["forecast"]["status"], "complete");
    assert_eq!(view["mtd"]["dates"].as_array().unwrap().len(), 28);
    assert_eq!(view["ytd"]["end"], "2026-02-28");
    assert_eq!(view["ytd"]["total"], json!(580.0));
}

#[test]
fn writes_html_report_with_deterministic_name() {
    let out = TempDir::new().unwrap();
    costreport(&out)
        .args(["--input-dir", ACCOUNTS])
        .assert()
        .success()
        .stdout(predicate::str::contains("Report written to"));

    let path = out
        .path()
        .join("cost-report-2026-03-alpha-111111111111__beta-prod_eu-222222222222.html");
    let html = std::fs::read_to_string(&path).expect("report file");
    assert!(html.contains("<title>AWS cost report 2026-03 (alpha, beta-prod.eu)</title>"));
    assert!(html.contains("\"label\":\"beta-prod.eu\""));
    assert!(html.contains("cdn.jsdelivr.net/npm/chart.js"));
    assert!(html.contains("Service"));
    assert!(!html.contains("__REPORT_DATA__"));
}

#[test]
fn csv_export_has_one_row_per_service_plus_header_and_total() {
    let out = TempDir::new().unwrap();
    let csv_path = out.path().join("combined.csv");
    costreport(&out)
        .args(["--input-dir", ACCOUNTS, "--csv"])
        .arg(&csv_path)
        .assert()
        .success();

    let csv = std::fs::read_to_string(&csv_path).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4 + 2);
    assert!(lines[0].starts_with("Service,2026-03-01,2026-03-02,"));
    assert!(lines[0].ends_with(",2026-03-10,Total"));
    assert!(lines[1].starts_with("Amazon Elastic Compute Cloud - Compute,15.00,"));
    assert!(lines[1].ends_with(",150.00"));
    assert!(lines[5].starts_with("Total,18.50,"));
    assert!(lines[5].ends_with(",275.00"));
}

#[test]
fn malformed_response_aborts() {
    let out = TempDir::new().unwrap();
    costreport(&out)
        .args(["--input-dir", ERRORS, "--profile", "malformed"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Malformed cost response for profile 'malformed'",
        ));
}

#[test]
fn empty_response_aborts() {
    let out = TempDir::new().unwrap();
    costreport(&out)
        .args(["--input-dir", ERRORS, "--profile", "empty"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Empty cost response for profile 'empty'"));
}

#[test]
fn unknown_profile_is_a_credential_failure() {
    let out = TempDir::new().unwrap();
    costreport(&out)
        .args(["--input-dir", ACCOUNTS, "--profile", "alpha,ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Invalid or missing credentials for profile 'ghost'",
        ));
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn rejects_bad_and_future_months() {
    let out = TempDir::new().unwrap();
    costreport(&out)
        .args(["2026-13", "--input-dir", ACCOUNTS])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected YYYY-MM"));
    costreport(&out)
        .args(["2026-05", "--input-dir", ACCOUNTS])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has not started yet"));
}

#[test]
fn missing_aws_cli_is_reported() {
    let out = TempDir::new().unwrap();
    let config = out.path().join("config.json");
    std::fs::write(
        &config,
        r#"{"aws_cli": "costreport-test-no-such-aws-cli", "profiles": ["dev"]}"#,
    )
    .unwrap();
    costreport(&out)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found on PATH"));
}

#[test]
fn config_is_validated_against_schema() {
    let out = TempDir::new().unwrap();
    let config = out.path().join("config.json");
    std::fs::write(&config, r#"{"threshold": -1, "colour": "blue"}"#).unwrap();
    costreport(&out)
        .args(["--input-dir", ACCOUNTS, "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("costreport config validation failed"));
}

#[test]
fn config_supplies_profiles_and_threshold() {
    let out = TempDir::new().unwrap();
    let config = out.path().join("config.json");
    std::fs::write(
        &config,
        r#"{"profiles": ["beta-prod.eu"], "threshold": 1.5, "json": true}"#,
    )
    .unwrap();
    let output = costreport(&out)
        .args(["--input-dir", ACCOUNTS, "--config"])
        .arg(&config)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(v["threshold"], json!(1.5));
    assert_eq!(v["views"].as_array().unwrap().len(), 1);
    assert_eq!(v["views"][0]["label"], "beta-prod.eu");
}
