//! Per-conversation message collection command
//!
//! Fans one collection task per stored conversation out over the worker
//! pool, merges the results, and grades what came back. One failing
//! conversation never sinks the run; it is counted, logged, and reflected
//! in the exit code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::cli::{cancel_on_ctrl_c, RecencyFilter};
use crate::collector::Collector;
use crate::config::Config;
use crate::model::{RunBatch, Termination};
use crate::pacing::{Pacer, StopPolicy};
use crate::pool::WorkerPool;
use crate::quality;
use crate::run::{RunSummary, RunWriter, TaskTally};
use crate::source::{ApiTransport, MessageSource};
use crate::store::CentralStore;

pub async fn run(
    config: &Config,
    filter: RecencyFilter,
    limit: Option<usize>,
    workers: Option<usize>,
    skip_existing: bool,
    dry_run: bool,
) -> Result<()> {
    let store = CentralStore::open(config.data_dir())?;
    let transport = ApiTransport::from_config(&config.api)?;

    let cutoff = filter.cutoff(Utc::now());
    let mut conversations = store.load_conversations(|c| match (cutoff, c.updated_ts()) {
        (Some(cutoff), Some(ts)) => ts >= cutoff,
        // Unparsable activity date: keep it, refetching is the safe side
        _ => true,
    })?;
    if conversations.is_empty() {
        anyhow::bail!("no conversations in the central store; run 'corral chats' first");
    }
    if let Some(limit) = limit {
        conversations.truncate(limit);
    }

    let ids: Vec<i64> = conversations.iter().map(|c| c.id).collect();
    let complete: HashSet<i64> = conversations
        .iter()
        .filter(|c| c.messages_complete)
        .map(|c| c.id)
        .collect();

    let workers = workers.unwrap_or(config.collect.workers).clamp(1, 3);
    let pacer = Arc::new(Pacer::new(config.pacing.clone()));
    let collector = Arc::new(Collector::new(
        Arc::clone(&pacer),
        config.collect.max_retries,
    ));
    let stop = StopPolicy {
        empty_page_limit: Some(config.collect.empty_page_limit),
        deadline: Some(Duration::from_secs(config.collect.task_timeout_secs)),
        ..StopPolicy::default()
    };
    let pool = WorkerPool::new(collector, workers, stop, cancel_on_ctrl_c());

    println!(
        "Collecting messages for {} conversations with {} worker(s)...",
        ids.len(),
        workers
    );
    let started = Utc::now();

    let skip = if skip_existing {
        Some(move |id: i64| complete.contains(&id))
    } else {
        None
    };
    let results = pool
        .run(&ids, move |id| MessageSource::new(transport.clone(), id), skip)
        .await;

    let mut batch = RunBatch::new();
    batch.started_at = started;
    let mut completed_ids = Vec::new();
    for result in results {
        // Natural pagination end means this conversation is now fully
        // collected; stop-policy ends do not.
        if result.outcome.termination == Some(Termination::Exhausted) {
            completed_ids.push(result.outcome.conversation_id);
        }
        batch.messages.extend(result.messages);
        batch.outcomes.push(result.outcome);
    }
    let tally = TaskTally::count(&batch.outcomes);

    let run_type = if dry_run { "messages_dryrun" } else { "messages" };
    let writer = RunWriter::create(&config.data_dir(), run_type)?;
    writer.write_messages(&batch.messages)?;
    writer.write_failures(&batch.outcomes)?;

    let merge_result = if dry_run {
        None
    } else {
        let result = store.merge(&batch).await?;
        store.mark_messages_complete(&completed_ids).await?;
        Some(result)
    };

    let message_counts: HashMap<i64, usize> = if dry_run {
        let mut counts = HashMap::new();
        for message in &batch.messages {
            *counts.entry(message.conversation_id).or_insert(0) += 1;
        }
        counts
    } else {
        ids.iter()
            .map(|&id| (id, store.message_count(id).unwrap_or(0)))
            .collect()
    };
    let report = quality::evaluate(&conversations, &message_counts, Utc::now());
    writer.write_quality(&report)?;

    let status = if dry_run {
        "dry_run"
    } else if tally.failed > 0 {
        "completed_with_failures"
    } else {
        "completed"
    };
    let completed_at = Utc::now();
    let summary = RunSummary {
        run_id: writer.run_id().to_string(),
        run_type: run_type.to_string(),
        status: status.to_string(),
        dry_run,
        started_at: batch.started_at,
        completed_at,
        duration_secs: (completed_at - batch.started_at).num_milliseconds() as f64 / 1_000.0,
        conversations_collected: 0,
        messages_collected: batch.messages.len(),
        tasks: tally,
        merge: merge_result.clone(),
        pacing: pacer.stats(),
        outcomes: batch.outcomes.clone(),
    };
    writer.write_summary(&summary)?;

    println!("\n{}", "=".repeat(60));
    println!(
        "Conversations: {} succeeded, {} partial, {} failed, {} skipped",
        tally.succeeded, tally.partial, tally.failed, tally.skipped
    );
    println!("Messages collected: {}", batch.messages.len());
    if let Some(merge) = &merge_result {
        println!(
            "Merge: {} new messages, {} already stored",
            merge.messages_inserted, merge.messages_skipped
        );
        if !merge.orphaned.is_empty() {
            println!(
                "Warning: {} conversation id(s) unknown to the store",
                merge.orphaned.len()
            );
        }
    } else {
        println!("Dry run: nothing merged");
    }
    println!(
        "Quality: {:.1}/100 (grade {})",
        report.scores.total, report.grade
    );
    println!("Results saved to: {}", writer.dir().display());

    if tally.failed > 0 {
        anyhow::bail!(
            "{} conversation(s) failed after retries; error log at {}",
            tally.failed,
            writer.dir().display()
        );
    }
    Ok(())
}
