//! Store validation command

use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::quality;
use crate::store::CentralStore;

pub fn run(config: &Config, json: bool) -> Result<()> {
    let store = CentralStore::open(config.data_dir())?;
    let snapshot = store.snapshot()?;
    let report = quality::evaluate_store(&snapshot, Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n{}", "=".repeat(60));
    println!(
        "Dataset quality: {:.1}/100 (grade {})",
        report.scores.total, report.grade
    );
    println!("{}", "=".repeat(60));
    println!("  Completeness  {:>5.1} / 40", report.scores.completeness);
    println!("  Validity      {:>5.1} / 30", report.scores.validity);
    println!("  Consistency   {:>5.1} / 20", report.scores.consistency);
    println!("  Anomalies     {:>5.1} / 10", report.scores.anomalies);

    println!(
        "\nRecords: {} conversations, {} messages ({} conversations with messages)",
        report.total_records,
        report.coverage.total_messages,
        report.coverage.conversations_with_messages
    );
    if let (Some(oldest), Some(newest)) = (
        &report.coverage.oldest_activity,
        &report.coverage.newest_activity,
    ) {
        let span = report
            .coverage
            .span_days
            .map(|d| format!(" ({d} days)"))
            .unwrap_or_default();
        println!("Activity: {oldest} .. {newest}{span}");
    }

    if !report.issues.is_empty() {
        println!("\nIssues ({}):", report.issues.len());
        for issue in report.issues.iter().take(20) {
            println!(
                "  [{}] conversation {}: {}",
                issue.kind, issue.conversation_id, issue.detail
            );
        }
        if report.issues.len() > 20 {
            println!("  ... and {} more", report.issues.len() - 20);
        }
    }

    if !report.anomalies.is_empty() {
        println!("\nAnomalies ({}):", report.anomalies.len());
        for anomaly in &report.anomalies {
            println!("  [{}] {}", anomaly.kind, anomaly.detail);
        }
    }

    Ok(())
}
