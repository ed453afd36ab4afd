//! Conversation-list collection command

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::cli::{cancel_on_ctrl_c, RecencyFilter};
use crate::collector::{Collector, Harvest};
use crate::config::Config;
use crate::model::RunBatch;
use crate::pacing::{Pacer, StopPolicy};
use crate::quality;
use crate::run::{RunSummary, RunWriter, TaskTally};
use crate::source::{ApiTransport, ConversationListSource};
use crate::store::CentralStore;

pub async fn run(
    config: &Config,
    filter: RecencyFilter,
    limit: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let store = CentralStore::open(config.data_dir())?;
    let transport = ApiTransport::from_config(&config.api)?;
    let pacer = Arc::new(Pacer::new(config.pacing.clone()));
    let collector = Collector::new(Arc::clone(&pacer), config.collect.max_retries);
    let cancel = cancel_on_ctrl_c();

    let stop = StopPolicy {
        empty_page_limit: Some(config.collect.empty_page_limit),
        record_limit: limit.map(|n| n as usize),
        cutoff: filter.cutoff(Utc::now()),
        ..StopPolicy::default()
    };

    println!("Collecting conversation list...");
    let started = Utc::now();
    let mut source = ConversationListSource::new(transport);
    let Harvest {
        records,
        pages,
        duplicates,
        termination,
        failures,
        duration,
    } = collector.collect(&mut source, &stop, &cancel).await;

    let mut batch = RunBatch::new();
    batch.started_at = started;
    batch.conversations = records;
    if let Some(limit) = limit {
        batch.conversations.truncate(limit as usize);
    }

    let run_type = if dry_run { "chats_dryrun" } else { "chats" };
    let writer = RunWriter::create(&config.data_dir(), run_type)?;
    writer.write_conversations(&batch.conversations)?;

    let merge_result = if dry_run {
        None
    } else {
        Some(store.merge(&batch).await?)
    };

    // Grade this run's conversations against whatever messages the store
    // already holds for them.
    let mut message_counts = HashMap::new();
    for conversation in &batch.conversations {
        message_counts.insert(
            conversation.id,
            store.message_count(conversation.id).unwrap_or(0),
        );
    }
    let report = quality::evaluate(&batch.conversations, &message_counts, Utc::now());
    writer.write_quality(&report)?;

    let status = if dry_run {
        "dry_run"
    } else if failures.is_empty() {
        "completed"
    } else {
        "completed_with_failures"
    };
    let summary = RunSummary {
        run_id: writer.run_id().to_string(),
        run_type: run_type.to_string(),
        status: status.to_string(),
        dry_run,
        started_at: batch.started_at,
        completed_at: Utc::now(),
        duration_secs: duration.as_secs_f64(),
        conversations_collected: batch.conversations.len(),
        messages_collected: 0,
        tasks: TaskTally::default(),
        merge: merge_result.clone(),
        pacing: pacer.stats(),
        outcomes: Vec::new(),
    };
    writer.write_summary(&summary)?;

    println!("\n{}", "=".repeat(60));
    println!(
        "Collected {} conversations over {} pages ({} duplicates filtered)",
        batch.conversations.len(),
        pages,
        duplicates
    );
    println!("Termination: {}", termination.as_str());
    if let Some(merge) = &merge_result {
        println!(
            "Merge: {} new, {} updated, {} unchanged",
            merge.conversations_inserted, merge.conversations_updated, merge.conversations_skipped
        );
    } else {
        println!("Dry run: nothing merged");
    }
    println!(
        "Quality: {:.1}/100 (grade {})",
        report.scores.total, report.grade
    );
    println!("Results saved to: {}", writer.dir().display());

    if !failures.is_empty() {
        anyhow::bail!(
            "{} page range(s) failed after retries; see {}",
            failures.len(),
            writer.dir().display()
        );
    }
    Ok(())
}
