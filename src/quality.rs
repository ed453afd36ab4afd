//! Dataset quality scoring
//!
//! Four weighted dimensions sum to a 0-100 score: completeness (40),
//! validity (30), consistency (20), anomalies (10). The reference
//! instant comes in as an argument and every collection is sorted, so
//! evaluating an unchanged snapshot twice yields an identical report.
//! Anomalous records are flagged, never excluded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{parse_timestamp, Conversation};
use crate::store::Snapshot;

const COMPLETENESS_POINTS: f64 = 40.0;
const VALIDITY_POINTS: f64 = 30.0;
const CONSISTENCY_POINTS: f64 = 20.0;
const ANOMALY_POINTS: f64 = 10.0;

const IQR_FACTOR: f64 = 1.5;
const MIN_IQR_SAMPLES: usize = 4;
const FREQUENT_COUNTERPARTY_THRESHOLD: usize = 10;

/// Required on every conversation: created_at, updated_at, service title,
/// counterparty, price, at least one message.
const REQUIRED_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DimensionScores {
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub anomalies: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Grade::A
        } else if score >= 80.0 {
            Grade::B
        } else if score >= 70.0 {
            Grade::C
        } else if score >= 60.0 {
            Grade::D
        } else {
            Grade::F
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Info,
}

/// A single record-level defect.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub conversation_id: i64,
    pub kind: &'static str,
    pub field: &'static str,
    pub detail: String,
}

/// A dataset-level oddity. Warning-severity anomalies deduct from the
/// anomaly sub-score; info-severity ones are advisory.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: &'static str,
    pub severity: Severity,
    pub detail: String,
    pub conversation_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceSummary {
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub median: f64,
}

/// Where and how densely the dataset covers activity.
#[derive(Debug, Clone, Serialize)]
pub struct Coverage {
    pub oldest_activity: Option<String>,
    pub newest_activity: Option<String>,
    pub span_days: Option<i64>,
    pub service_distribution: BTreeMap<String, usize>,
    pub conversations_with_messages: usize,
    pub total_messages: usize,
    pub price: Option<PriceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,
    pub scores: DimensionScores,
    pub grade: Grade,
    pub duplicate_ids: Vec<i64>,
    pub timeline_violations: Vec<i64>,
    pub issues: Vec<ValidationIssue>,
    pub anomalies: Vec<Anomaly>,
    pub coverage: Coverage,
}

/// Grade a store snapshot.
pub fn evaluate_store(snapshot: &Snapshot, as_of: DateTime<Utc>) -> QualityReport {
    evaluate(&snapshot.conversations, &snapshot.message_counts, as_of)
}

/// Grade a set of conversations with their message counts. Pure: no
/// clocks, no I/O, no randomness.
pub fn evaluate(
    conversations: &[Conversation],
    message_counts: &HashMap<i64, usize>,
    as_of: DateTime<Utc>,
) -> QualityReport {
    let total = conversations.len();
    if total == 0 {
        return empty_report(as_of);
    }

    let mut issues: Vec<ValidationIssue> = Vec::new();

    let completeness = check_completeness(conversations, message_counts, &mut issues);
    let validity = check_validity(conversations, as_of, &mut issues);
    let (consistency, duplicate_ids, timeline_violations) =
        check_consistency(conversations, &mut issues);
    let (anomaly_score, anomalies) = detect_anomalies(conversations, message_counts);
    let coverage = analyze_coverage(conversations, message_counts);

    issues.sort_by(|a, b| {
        (a.conversation_id, a.kind, a.field).cmp(&(b.conversation_id, b.kind, b.field))
    });

    let scores = DimensionScores {
        completeness,
        validity,
        consistency,
        anomalies: anomaly_score,
        total: completeness + validity + consistency + anomaly_score,
    };

    QualityReport {
        generated_at: as_of,
        total_records: total,
        grade: Grade::from_score(scores.total),
        scores,
        duplicate_ids,
        timeline_violations,
        issues,
        anomalies,
        coverage,
    }
}

fn empty_report(as_of: DateTime<Utc>) -> QualityReport {
    QualityReport {
        generated_at: as_of,
        total_records: 0,
        scores: DimensionScores {
            completeness: 0.0,
            validity: 0.0,
            consistency: 0.0,
            anomalies: 0.0,
            total: 0.0,
        },
        grade: Grade::F,
        duplicate_ids: Vec::new(),
        timeline_violations: Vec::new(),
        issues: Vec::new(),
        anomalies: Vec::new(),
        coverage: Coverage {
            oldest_activity: None,
            newest_activity: None,
            span_days: None,
            service_distribution: BTreeMap::new(),
            conversations_with_messages: 0,
            total_messages: 0,
            price: None,
        },
    }
}

/// Mean fraction of required fields present, scaled to 40 points. Each
/// miss also becomes an issue.
fn check_completeness(
    conversations: &[Conversation],
    message_counts: &HashMap<i64, usize>,
    issues: &mut Vec<ValidationIssue>,
) -> f64 {
    let mut fraction_sum = 0.0;

    for conversation in conversations {
        let mut present = 0usize;
        let mut miss = |field: &'static str, issues: &mut Vec<ValidationIssue>| {
            issues.push(ValidationIssue {
                conversation_id: conversation.id,
                kind: "missing_field",
                field,
                detail: format!("required field '{field}' is missing"),
            });
        };

        if conversation.created_at.trim().is_empty() {
            miss("created_at", issues);
        } else {
            present += 1;
        }
        if conversation.updated_at.trim().is_empty() {
            miss("updated_at", issues);
        } else {
            present += 1;
        }
        if conversation.service.title.trim().is_empty() {
            miss("service.title", issues);
        } else {
            present += 1;
        }
        if conversation.counterparty.name.trim().is_empty() && conversation.counterparty.id == 0 {
            miss("counterparty", issues);
        } else {
            present += 1;
        }
        if conversation.price.is_none() {
            miss("price", issues);
        } else {
            present += 1;
        }
        if message_counts.get(&conversation.id).copied().unwrap_or(0) == 0 {
            miss("messages", issues);
        } else {
            present += 1;
        }

        fraction_sum += present as f64 / REQUIRED_FIELDS as f64;
    }

    fraction_sum / conversations.len() as f64 * COMPLETENESS_POINTS
}

/// Fraction of records passing format and range checks, scaled to 30
/// points. Absent fields are completeness's business, not validity's.
fn check_validity(
    conversations: &[Conversation],
    as_of: DateTime<Utc>,
    issues: &mut Vec<ValidationIssue>,
) -> f64 {
    let mut valid = 0usize;

    for conversation in conversations {
        let mut ok = true;

        for (field, raw) in [
            ("created_at", &conversation.created_at),
            ("updated_at", &conversation.updated_at),
        ] {
            if raw.trim().is_empty() {
                continue;
            }
            match parse_timestamp(raw) {
                None => {
                    issues.push(ValidationIssue {
                        conversation_id: conversation.id,
                        kind: "invalid_timestamp",
                        field,
                        detail: format!("'{raw}' is not a valid RFC3339 timestamp"),
                    });
                    ok = false;
                }
                Some(ts) if ts > as_of => {
                    issues.push(ValidationIssue {
                        conversation_id: conversation.id,
                        kind: "future_timestamp",
                        field,
                        detail: format!("'{raw}' is in the future"),
                    });
                    ok = false;
                }
                Some(_) => {}
            }
        }

        if let Some(price) = conversation.price {
            if price < 0 {
                issues.push(ValidationIssue {
                    conversation_id: conversation.id,
                    kind: "negative_price",
                    field: "price",
                    detail: format!("price is negative: {price}"),
                });
                ok = false;
            }
        }
        if conversation.unread_count < 0 {
            issues.push(ValidationIssue {
                conversation_id: conversation.id,
                kind: "negative_count",
                field: "unread_count",
                detail: format!("unread count is negative: {}", conversation.unread_count),
            });
            ok = false;
        }

        if ok {
            valid += 1;
        }
    }

    valid as f64 / conversations.len() as f64 * VALIDITY_POINTS
}

/// Duplicate ids and inverted timelines, scaled to 20 points.
fn check_consistency(
    conversations: &[Conversation],
    issues: &mut Vec<ValidationIssue>,
) -> (f64, Vec<i64>, Vec<i64>) {
    let mut seen: HashMap<i64, usize> = HashMap::new();
    let mut duplicate_ids = Vec::new();
    let mut timeline_violations = Vec::new();

    for conversation in conversations {
        let count = seen.entry(conversation.id).or_insert(0);
        *count += 1;
        if *count > 1 {
            duplicate_ids.push(conversation.id);
            issues.push(ValidationIssue {
                conversation_id: conversation.id,
                kind: "duplicate_id",
                field: "id",
                detail: format!("id {} appears more than once", conversation.id),
            });
        }

        if let (Some(created), Some(updated)) =
            (conversation.created_ts(), conversation.updated_ts())
        {
            if created > updated {
                timeline_violations.push(conversation.id);
                issues.push(ValidationIssue {
                    conversation_id: conversation.id,
                    kind: "timeline_inversion",
                    field: "created_at",
                    detail: "created_at is later than updated_at".to_string(),
                });
            }
        }
    }

    duplicate_ids.sort_unstable();
    timeline_violations.sort_unstable();

    let violations = duplicate_ids.len() + timeline_violations.len();
    let fraction = 1.0 - violations as f64 / conversations.len() as f64;
    (
        fraction.max(0.0) * CONSISTENCY_POINTS,
        duplicate_ids,
        timeline_violations,
    )
}

/// IQR outliers on prices (per service category) and message counts, plus
/// heuristic flags. Returns the scaled sub-score and the anomaly list.
fn detect_anomalies(
    conversations: &[Conversation],
    message_counts: &HashMap<i64, usize>,
) -> (f64, Vec<Anomaly>) {
    let mut anomalies: Vec<Anomaly> = Vec::new();
    let mut flagged: std::collections::BTreeSet<i64> = std::collections::BTreeSet::new();

    // Price outliers, grouped by service category
    let mut by_service: BTreeMap<&str, Vec<(i64, f64)>> = BTreeMap::new();
    for conversation in conversations {
        if let Some(price) = conversation.price {
            if price >= 0 {
                by_service
                    .entry(conversation.service.title.as_str())
                    .or_default()
                    .push((conversation.id, price as f64));
            }
        }
    }
    for (service, samples) in &by_service {
        let outliers = iqr_outliers(samples);
        if !outliers.is_empty() {
            flagged.extend(&outliers);
            let label = if service.is_empty() { "(unknown)" } else { *service };
            anomalies.push(Anomaly {
                kind: "price_outlier",
                severity: Severity::Warning,
                detail: format!("{} price outlier(s) in '{label}'", outliers.len()),
                conversation_ids: outliers,
            });
        }
    }

    // Unusually high (or low) message counts across conversations
    let count_samples: Vec<(i64, f64)> = conversations
        .iter()
        .map(|c| {
            (
                c.id,
                message_counts.get(&c.id).copied().unwrap_or(0) as f64,
            )
        })
        .collect();
    let count_outliers = iqr_outliers(&count_samples);
    if !count_outliers.is_empty() {
        flagged.extend(&count_outliers);
        anomalies.push(Anomaly {
            kind: "message_count_outlier",
            severity: Severity::Warning,
            detail: format!("{} conversation(s) with outlying message counts", count_outliers.len()),
            conversation_ids: count_outliers,
        });
    }

    // One counterparty spread across unusually many conversations
    let mut per_counterparty: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for conversation in conversations {
        if conversation.counterparty.id != 0 {
            per_counterparty
                .entry(conversation.counterparty.id)
                .or_default()
                .push(conversation.id);
        }
    }
    for (counterparty_id, mut ids) in per_counterparty {
        if ids.len() > FREQUENT_COUNTERPARTY_THRESHOLD {
            ids.sort_unstable();
            flagged.extend(&ids);
            anomalies.push(Anomaly {
                kind: "frequent_counterparty",
                severity: Severity::Warning,
                detail: format!(
                    "counterparty {counterparty_id} appears in {} conversations",
                    ids.len()
                ),
                conversation_ids: ids,
            });
        }
    }

    // Advisory only: account states worth a look, no deduction
    let mut banned: Vec<i64> = conversations
        .iter()
        .filter(|c| c.counterparty.is_banned)
        .map(|c| c.id)
        .collect();
    if !banned.is_empty() {
        banned.sort_unstable();
        anomalies.push(Anomaly {
            kind: "banned_counterparty",
            severity: Severity::Info,
            detail: format!("{} conversation(s) with a banned counterparty", banned.len()),
            conversation_ids: banned,
        });
    }
    let mut dormant: Vec<i64> = conversations
        .iter()
        .filter(|c| c.counterparty.is_dormant)
        .map(|c| c.id)
        .collect();
    if !dormant.is_empty() {
        dormant.sort_unstable();
        anomalies.push(Anomaly {
            kind: "dormant_counterparty",
            severity: Severity::Info,
            detail: format!("{} conversation(s) with a dormant counterparty", dormant.len()),
            conversation_ids: dormant,
        });
    }

    let fraction = 1.0 - flagged.len() as f64 / conversations.len() as f64;
    (fraction.max(0.0) * ANOMALY_POINTS, anomalies)
}

/// Ids whose value falls outside `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]`. Needs at
/// least four samples; returns sorted ids.
fn iqr_outliers(samples: &[(i64, f64)]) -> Vec<i64> {
    if samples.len() < MIN_IQR_SAMPLES {
        return Vec::new();
    }

    let mut values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
    values.sort_by(|a, b| a.total_cmp(b));

    let q1 = quantile(&values, 0.25);
    let q3 = quantile(&values, 0.75);
    let iqr = q3 - q1;
    let lower = q1 - IQR_FACTOR * iqr;
    let upper = q3 + IQR_FACTOR * iqr;

    let mut outliers: Vec<i64> = samples
        .iter()
        .filter(|(_, v)| *v < lower || *v > upper)
        .map(|(id, _)| *id)
        .collect();
    outliers.sort_unstable();
    outliers
}

/// Linear-interpolation quantile over a sorted, non-empty sample.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = (sorted.len() - 1) as f64 * q;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn analyze_coverage(
    conversations: &[Conversation],
    message_counts: &HashMap<i64, usize>,
) -> Coverage {
    let mut oldest: Option<(DateTime<Utc>, String)> = None;
    let mut newest: Option<(DateTime<Utc>, String)> = None;
    let mut service_distribution: BTreeMap<String, usize> = BTreeMap::new();

    for conversation in conversations {
        if let Some(ts) = conversation.updated_ts() {
            if oldest.as_ref().map_or(true, |(o, _)| ts < *o) {
                oldest = Some((ts, conversation.updated_at.clone()));
            }
            if newest.as_ref().map_or(true, |(n, _)| ts > *n) {
                newest = Some((ts, conversation.updated_at.clone()));
            }
        }
        let title = if conversation.service.title.is_empty() {
            "(unknown)".to_string()
        } else {
            conversation.service.title.clone()
        };
        *service_distribution.entry(title).or_insert(0) += 1;
    }

    let span_days = match (&oldest, &newest) {
        (Some((o, _)), Some((n, _))) => Some((*n - *o).num_days()),
        _ => None,
    };

    let mut prices: Vec<f64> = conversations
        .iter()
        .filter_map(|c| c.price)
        .map(|p| p as f64)
        .collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let price = if prices.is_empty() {
        None
    } else {
        Some(PriceSummary {
            min: prices[0] as i64,
            max: prices[prices.len() - 1] as i64,
            mean: prices.iter().sum::<f64>() / prices.len() as f64,
            median: quantile(&prices, 0.5),
        })
    };

    let conversations_with_messages = conversations
        .iter()
        .filter(|c| message_counts.get(&c.id).copied().unwrap_or(0) > 0)
        .count();
    let total_messages = conversations
        .iter()
        .map(|c| message_counts.get(&c.id).copied().unwrap_or(0))
        .sum();

    Coverage {
        oldest_activity: oldest.map(|(_, raw)| raw),
        newest_activity: newest.map(|(_, raw)| raw),
        span_days,
        service_distribution,
        conversations_with_messages,
        total_messages,
        price,
    }
}
