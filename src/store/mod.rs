//! Central store: the deduplicated conversation and message universe
//!
//! Layout under the data directory:
//!   conversations.jsonl                 one conversation per line, sorted by id
//!   messages/conversation_<id>.jsonl    one message per line, append-only
//!
//! The conversation list is rewritten through a temp file and an atomic
//! rename; message files only ever grow, one line per write. A crash
//! mid-merge therefore never corrupts previously written records.
//!
//! Merges touching the same conversation serialize on a per-conversation
//! lock; different conversations proceed concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{parse_timestamp, Conversation, Message, RunBatch};

pub struct CentralStore {
    root: PathBuf,
    conversations_path: PathBuf,
    messages_dir: PathBuf,
    list_lock: Mutex<()>,
    conversation_locks: std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

/// What one merge did, for the caller to log and persist.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MergeResult {
    pub conversations_inserted: usize,
    pub conversations_updated: usize,
    pub conversations_skipped: usize,
    pub messages_inserted: usize,
    pub messages_skipped: usize,
    /// Conversation ids referenced by messages but absent from the list;
    /// the messages are stored anyway.
    pub orphaned: Vec<i64>,
}

impl MergeResult {
    pub fn total_inserted(&self) -> usize {
        self.conversations_inserted + self.messages_inserted
    }

    pub fn total_skipped(&self) -> usize {
        self.conversations_skipped + self.messages_skipped
    }
}

/// Everything the quality validator consumes.
#[derive(Debug)]
pub struct Snapshot {
    pub conversations: Vec<Conversation>,
    pub message_counts: HashMap<i64, usize>,
}

/// Dataset totals for the stats command.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub conversations: usize,
    pub conversations_complete: usize,
    pub messages: usize,
    pub services: usize,
    pub oldest_activity: Option<String>,
    pub newest_activity: Option<String>,
}

impl CentralStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let messages_dir = root.join("messages");
        fs::create_dir_all(&messages_dir)
            .with_context(|| format!("creating store at {}", root.display()))?;

        Ok(Self {
            conversations_path: root.join("conversations.jsonl"),
            messages_dir,
            root,
            list_lock: Mutex::new(()),
            conversation_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn message_path(&self, conversation_id: i64) -> PathBuf {
        self.messages_dir
            .join(format!("conversation_{conversation_id}.jsonl"))
    }

    fn conversation_lock(&self, conversation_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self
            .conversation_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(conversation_id).or_default())
    }

    // ============================================
    // MERGE
    // ============================================

    /// Merge one run's output. Conversations upsert by id with the newest
    /// observed version winning; messages insert only when absent.
    /// Replaying a batch is a no-op reported as skips.
    pub async fn merge(&self, batch: &RunBatch) -> Result<MergeResult> {
        let mut result = self.merge_conversations(&batch.conversations).await?;

        let mut by_parent: BTreeMap<i64, Vec<Message>> = BTreeMap::new();
        for message in &batch.messages {
            by_parent
                .entry(message.conversation_id)
                .or_default()
                .push(message.clone());
        }
        if by_parent.is_empty() {
            return Ok(result);
        }

        let known = self.conversation_ids()?;
        for (conversation_id, messages) in by_parent {
            if !known.contains(&conversation_id) {
                warn!(
                    conversation_id,
                    count = messages.len(),
                    "messages reference an unknown conversation"
                );
                result.orphaned.push(conversation_id);
            }
            let (inserted, skipped) = self.merge_messages(conversation_id, &messages).await?;
            result.messages_inserted += inserted;
            result.messages_skipped += skipped;
        }

        info!(
            inserted = result.total_inserted(),
            updated = result.conversations_updated,
            skipped = result.total_skipped(),
            "merge complete"
        );
        Ok(result)
    }

    /// Upsert conversations into the list file.
    pub async fn merge_conversations(&self, incoming: &[Conversation]) -> Result<MergeResult> {
        let mut result = MergeResult::default();
        if incoming.is_empty() {
            return Ok(result);
        }

        let _guard = self.list_lock.lock().await;
        let mut existing = self.load_conversation_map()?;

        for conversation in incoming {
            match existing.get(&conversation.id) {
                None => {
                    existing.insert(conversation.id, conversation.clone());
                    result.conversations_inserted += 1;
                }
                Some(current) => match reconcile(conversation, current) {
                    Some(replacement) => {
                        existing.insert(conversation.id, replacement);
                        result.conversations_updated += 1;
                    }
                    None => result.conversations_skipped += 1,
                },
            }
        }

        self.write_conversations(&existing)?;
        Ok(result)
    }

    /// Insert messages for one conversation, skipping ids already present.
    /// First write wins; the file only grows.
    pub async fn merge_messages(
        &self,
        conversation_id: i64,
        incoming: &[Message],
    ) -> Result<(usize, usize)> {
        if incoming.is_empty() {
            return Ok((0, 0));
        }

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        let path = self.message_path(conversation_id);
        let mut present: HashSet<i64> = HashSet::new();
        if path.exists() {
            for message in self.iter_messages(conversation_id)? {
                present.insert(message?.id);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut inserted = 0;
        let mut skipped = 0;
        for message in incoming {
            if present.insert(message.id) {
                serde_json::to_writer(&mut writer, message)?;
                writer.write_all(b"\n")?;
                inserted += 1;
            } else {
                skipped += 1;
            }
        }
        writer.flush()?;

        Ok((inserted, skipped))
    }

    /// Record that these conversations' message pagination reached its
    /// natural end, so resume runs can skip them.
    pub async fn mark_messages_complete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.list_lock.lock().await;
        let mut existing = self.load_conversation_map()?;
        let mut changed = 0;
        for id in ids {
            if let Some(conversation) = existing.get_mut(id) {
                if !conversation.messages_complete {
                    conversation.messages_complete = true;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.write_conversations(&existing)?;
        }
        Ok(changed)
    }

    // ============================================
    // LOAD
    // ============================================

    /// Lazy line-by-line reader over the conversation list; restartable by
    /// calling again.
    pub fn iter_conversations(&self) -> Result<RecordIter<Conversation>> {
        RecordIter::open(&self.conversations_path)
    }

    /// Lazy reader over one conversation's messages.
    pub fn iter_messages(&self, conversation_id: i64) -> Result<RecordIter<Message>> {
        RecordIter::open(&self.message_path(conversation_id))
    }

    /// Conversations matching a predicate, in id order.
    pub fn load_conversations<P>(&self, mut predicate: P) -> Result<Vec<Conversation>>
    where
        P: FnMut(&Conversation) -> bool,
    {
        let mut out = Vec::new();
        for conversation in self.iter_conversations()? {
            let conversation = conversation?;
            if predicate(&conversation) {
                out.push(conversation);
            }
        }
        Ok(out)
    }

    fn load_conversation_map(&self) -> Result<BTreeMap<i64, Conversation>> {
        let mut map = BTreeMap::new();
        for conversation in self.iter_conversations()? {
            let conversation = conversation?;
            map.insert(conversation.id, conversation);
        }
        Ok(map)
    }

    pub fn conversation_ids(&self) -> Result<HashSet<i64>> {
        let mut ids = HashSet::new();
        for conversation in self.iter_conversations()? {
            ids.insert(conversation?.id);
        }
        Ok(ids)
    }

    /// Stored message count for a conversation. Counts lines without
    /// deserializing.
    pub fn message_count(&self, conversation_id: i64) -> Result<usize> {
        let path = self.message_path(conversation_id);
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        );
        let mut count = 0;
        for line in reader.lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Materialize what the validator needs. A corrupt message file is
    /// isolated: it logs and contributes a zero count rather than failing
    /// the snapshot.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let conversations = self.load_conversations(|_| true)?;
        let mut message_counts = HashMap::new();
        for conversation in &conversations {
            match self.message_count(conversation.id) {
                Ok(count) => {
                    message_counts.insert(conversation.id, count);
                }
                Err(e) => {
                    warn!(conversation_id = conversation.id, error = %e, "unreadable message file");
                    message_counts.insert(conversation.id, 0);
                }
            }
        }
        Ok(Snapshot {
            conversations,
            message_counts,
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut conversations = 0;
        let mut conversations_complete = 0;
        let mut messages = 0;
        let mut services = HashSet::new();
        let mut oldest: Option<(chrono::DateTime<chrono::Utc>, String)> = None;
        let mut newest: Option<(chrono::DateTime<chrono::Utc>, String)> = None;

        for conversation in self.iter_conversations()? {
            let conversation = conversation?;
            conversations += 1;
            if conversation.messages_complete {
                conversations_complete += 1;
            }
            if !conversation.service.title.is_empty() {
                services.insert(conversation.service.title.clone());
            }
            if let Some(ts) = conversation.updated_ts() {
                if oldest.as_ref().map_or(true, |(o, _)| ts < *o) {
                    oldest = Some((ts, conversation.updated_at.clone()));
                }
                if newest.as_ref().map_or(true, |(n, _)| ts > *n) {
                    newest = Some((ts, conversation.updated_at.clone()));
                }
            }
            messages += self.message_count(conversation.id).unwrap_or(0);
        }

        Ok(StoreStats {
            conversations,
            conversations_complete,
            messages,
            services: services.len(),
            oldest_activity: oldest.map(|(_, raw)| raw),
            newest_activity: newest.map(|(_, raw)| raw),
        })
    }

    // ============================================
    // PERSISTENCE
    // ============================================

    fn write_conversations(&self, conversations: &BTreeMap<i64, Conversation>) -> Result<()> {
        let temp_path = self.conversations_path.with_extension("jsonl.tmp");
        {
            let file = File::create(&temp_path)
                .with_context(|| format!("creating {}", temp_path.display()))?;
            let mut writer = BufWriter::new(file);
            for conversation in conversations.values() {
                serde_json::to_writer(&mut writer, conversation)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&temp_path, &self.conversations_path)
            .with_context(|| format!("replacing {}", self.conversations_path.display()))?;
        Ok(())
    }
}

/// Decide whether `incoming` replaces `current`. The newest parsed
/// `updated_at` wins; an equal timestamp only counts when the content
/// actually changed, so replaying a batch reports skips. The completion
/// marker survives same-instant rewrites; a genuinely newer version
/// resets it, since new activity may mean new messages.
fn reconcile(incoming: &Conversation, current: &Conversation) -> Option<Conversation> {
    let incoming_ts = parse_timestamp(&incoming.updated_at);
    let current_ts = parse_timestamp(&current.updated_at);

    let newer = match (incoming_ts, current_ts) {
        (Some(a), Some(b)) if a != b => a > b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        // Same instant, or both unparsable: latest observation wins only
        // if it differs.
        _ => {
            let mut candidate = incoming.clone();
            candidate.messages_complete |= current.messages_complete;
            return (candidate != *current).then_some(candidate);
        }
    };

    newer.then(|| incoming.clone())
}

/// Lazy NDJSON reader. Yields one record per non-empty line; a malformed
/// line is an error for this file only.
pub struct RecordIter<T> {
    lines: Option<std::io::Lines<BufReader<File>>>,
    path: PathBuf,
    line_number: usize,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> RecordIter<T> {
    fn open(path: &Path) -> Result<Self> {
        let lines = if path.exists() {
            let file =
                File::open(path).with_context(|| format!("opening {}", path.display()))?;
            Some(BufReader::new(file).lines())
        } else {
            None
        };
        Ok(Self {
            lines,
            path: path.to_path_buf(),
            line_number: 0,
            _marker: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> Iterator for RecordIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    return Some(
                        Err(e).context(format!("reading {}", self.path.display())),
                    )
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).with_context(|| {
                format!("{} line {}", self.path.display(), self.line_number)
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{message, sparse_conversation};
    use crate::model::Service;

    fn conversation(id: i64, updated_at: &str) -> Conversation {
        Conversation {
            updated_at: updated_at.to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
            service: Service {
                title: "moving".to_string(),
            },
            ..sparse_conversation(id)
        }
    }

    fn batch_of(conversations: Vec<Conversation>, messages: Vec<Message>) -> RunBatch {
        RunBatch {
            conversations,
            messages,
            ..RunBatch::new()
        }
    }

    #[tokio::test]
    async fn test_merge_then_replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        let batch = batch_of(
            vec![
                conversation(1, "2025-06-01T00:00:00Z"),
                conversation(2, "2025-06-02T00:00:00Z"),
            ],
            vec![message(10, 1), message(11, 1), message(20, 2)],
        );

        let first = store.merge(&batch).await.unwrap();
        assert_eq!(first.conversations_inserted, 2);
        assert_eq!(first.messages_inserted, 3);

        let second = store.merge(&batch).await.unwrap();
        assert_eq!(second.conversations_inserted, 0);
        assert_eq!(second.conversations_updated, 0);
        assert_eq!(second.total_skipped(), 5);

        // Store state is unchanged by the replay
        assert_eq!(store.load_conversations(|_| true).unwrap().len(), 2);
        assert_eq!(store.message_count(1).unwrap(), 2);
        assert_eq!(store.message_count(2).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_newest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        let mut original = conversation(1, "2025-06-01T00:00:00Z");
        original.unread_count = 5;
        store
            .merge(&batch_of(vec![original.clone()], vec![]))
            .await
            .unwrap();

        // Older copy never regresses the stored version
        let mut stale = conversation(1, "2025-05-01T00:00:00Z");
        stale.unread_count = 99;
        let result = store.merge(&batch_of(vec![stale], vec![])).await.unwrap();
        assert_eq!(result.conversations_skipped, 1);
        let stored = &store.load_conversations(|_| true).unwrap()[0];
        assert_eq!(stored.unread_count, 5);

        // Newer copy replaces it
        let mut fresh = conversation(1, "2025-07-01T00:00:00Z");
        fresh.unread_count = 0;
        let result = store.merge(&batch_of(vec![fresh], vec![])).await.unwrap();
        assert_eq!(result.conversations_updated, 1);
        let stored = &store.load_conversations(|_| true).unwrap()[0];
        assert_eq!(stored.unread_count, 0);
    }

    #[tokio::test]
    async fn test_messages_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        let original = message(10, 1);
        store
            .merge(&batch_of(vec![conversation(1, "2025-06-01T00:00:00Z")], vec![original.clone()]))
            .await
            .unwrap();

        let mut restated = original.clone();
        restated.body = "edited after the fact".to_string();
        let result = store
            .merge(&batch_of(vec![], vec![restated]))
            .await
            .unwrap();
        assert_eq!(result.messages_inserted, 0);
        assert_eq!(result.messages_skipped, 1);

        let stored: Vec<Message> = store
            .iter_messages(1)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, original.body);
    }

    #[tokio::test]
    async fn test_no_duplicate_ids_after_any_merge_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        for _ in 0..3 {
            store
                .merge(&batch_of(
                    vec![
                        conversation(1, "2025-06-01T00:00:00Z"),
                        conversation(2, "2025-06-01T00:00:00Z"),
                    ],
                    vec![message(10, 1), message(10, 1), message(11, 2)],
                ))
                .await
                .unwrap();
        }

        let conversations = store.load_conversations(|_| true).unwrap();
        let mut ids: Vec<i64> = conversations.iter().map(|c| c.id).collect();
        ids.dedup();
        assert_eq!(ids, vec![1, 2]);

        let stored: Vec<Message> = store
            .iter_messages(1)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_messages_stored_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        let result = store
            .merge(&batch_of(vec![], vec![message(10, 404)]))
            .await
            .unwrap();
        assert_eq!(result.orphaned, vec![404]);
        assert_eq!(result.messages_inserted, 1);
        assert_eq!(store.message_count(404).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_marker_survives_replay_but_not_new_activity() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        let original = conversation(1, "2025-06-01T00:00:00Z");
        store
            .merge(&batch_of(vec![original.clone()], vec![]))
            .await
            .unwrap();
        store.mark_messages_complete(&[1]).await.unwrap();

        // Replaying the same observation keeps the marker
        let result = store
            .merge(&batch_of(vec![original], vec![]))
            .await
            .unwrap();
        assert_eq!(result.conversations_skipped, 1);
        assert!(store.load_conversations(|_| true).unwrap()[0].messages_complete);

        // A newer observation resets it
        store
            .merge(&batch_of(vec![conversation(1, "2025-07-01T00:00:00Z")], vec![]))
            .await
            .unwrap();
        assert!(!store.load_conversations(|_| true).unwrap()[0].messages_complete);
    }

    #[tokio::test]
    async fn test_concurrent_merges_into_same_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CentralStore::open(dir.path()).unwrap());

        let mut handles = Vec::new();
        for worker in 0..4i64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let messages: Vec<Message> =
                    (0..25).map(|n| message(worker * 100 + n, 7)).collect();
                store.merge_messages(7, &messages).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored: Vec<Message> = store
            .iter_messages(7)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(stored.len(), 100);
        let ids: HashSet<i64> = stored.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_malformed_line_fails_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        store
            .merge(&batch_of(
                vec![conversation(1, "2025-06-01T00:00:00Z")],
                vec![message(10, 1)],
            ))
            .await
            .unwrap();

        // Corrupt conversation 2's file by hand
        fs::write(
            dir.path().join("messages/conversation_2.jsonl"),
            "{not json\n",
        )
        .unwrap();

        assert!(store
            .iter_messages(2)
            .unwrap()
            .collect::<Result<Vec<Message>>>()
            .is_err());
        // Conversation 1 is untouched
        assert_eq!(store.message_count(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_load_is_lazy_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CentralStore::open(dir.path()).unwrap();

        let conversations: Vec<Conversation> = (1..=50)
            .map(|id| conversation(id, "2025-06-01T00:00:00Z"))
            .collect();
        store
            .merge(&batch_of(conversations, vec![]))
            .await
            .unwrap();

        let first_pass = store.iter_conversations().unwrap().count();
        let second_pass = store.iter_conversations().unwrap().count();
        assert_eq!(first_pass, 50);
        assert_eq!(second_pass, 50);

        let filtered = store
            .load_conversations(|c| c.id <= 10)
            .unwrap();
        assert_eq!(filtered.len(), 10);
    }
}
