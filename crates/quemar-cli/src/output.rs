//! Output formatting for run reports.

use clap::ValueEnum;
use quemar_core::telemetry::Diagnosis;
use quemar_core::RunReport;
use serde::Serialize;

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable text summary.
    #[default]
    Text,
    /// JSON report.
    Json,
}

/// Serializable report for JSON output.
#[derive(Debug, Serialize)]
struct ReportOutput<'a> {
    pages: u64,
    error_count: u64,
    failed_diagnoses: u64,
    process_errors: u64,
    total_data_mb: f64,
    total_bandwidth_mb_s: f64,
    passed: bool,
    diagnoses: &'a [Diagnosis],
}

impl<'a> From<&'a RunReport> for ReportOutput<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            pages: report.pages,
            error_count: report.error_count,
            failed_diagnoses: report.failed_diagnoses,
            process_errors: report.process_errors,
            total_data_mb: report.total_data_mb,
            total_bandwidth_mb_s: report.total_bandwidth_mb_s,
            passed: report.passed,
            diagnoses: &report.diagnoses,
        }
    }
}

/// Render a finished run's report in the chosen format.
pub fn print_report(report: &RunReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => print_text(report),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ReportOutput::from(report))?);
        }
    }
    Ok(())
}

fn print_text(report: &RunReport) {
    println!(
        "Stats: {:.2}MB copied at {:.2}MB/s over {} pages",
        report.total_data_mb, report.total_bandwidth_mb_s, report.pages
    );
    for diagnosis in &report.diagnoses {
        println!("Finding [{}]: {}", diagnosis.verdict, diagnosis.message);
    }
    if report.passed {
        println!("Status: PASS - please verify no corrected errors");
    } else {
        println!(
            "Status: FAIL - {} hardware incidents, {} failed diagnoses",
            report.error_count, report.failed_diagnoses
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quemar_core::telemetry::DiagnosisKind;

    fn sample_report() -> RunReport {
        RunReport {
            pages: 64,
            error_count: 1,
            failed_diagnoses: 1,
            process_errors: 0,
            total_data_mb: 512.0,
            total_bandwidth_mb_s: 1024.5,
            diagnoses: vec![Diagnosis {
                verdict: "memory-miscompare-fail".to_string(),
                kind: DiagnosisKind::Fail,
                message: "miscompare at 0x1000".to_string(),
            }],
            passed: false,
        }
    }

    #[test]
    fn test_json_report_carries_every_field() {
        let report = sample_report();
        let json = serde_json::to_string_pretty(&ReportOutput::from(&report)).unwrap();
        assert!(json.contains("\"pages\": 64"));
        assert!(json.contains("\"error_count\": 1"));
        assert!(json.contains("\"passed\": false"));
        assert!(json.contains("memory-miscompare-fail"));
        assert!(json.contains("miscompare at 0x1000"));
    }

    #[test]
    fn test_json_report_is_parseable() {
        let report = sample_report();
        let json = serde_json::to_string(&ReportOutput::from(&report)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["diagnoses"].as_array().unwrap().len(), 1);
        assert_eq!(value["diagnoses"][0]["kind"], "Fail");
    }

    #[test]
    fn test_print_report_both_formats() {
        let report = sample_report();
        print_report(&report, OutputFormat::Text).unwrap();
        print_report(&report, OutputFormat::Json).unwrap();
    }

    #[test]
    fn test_format_default_is_text() {
        assert!(matches!(OutputFormat::default(), OutputFormat::Text));
    }
}
