//! Core domain model for the ranking catalogue crawler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Rank text as published upstream: either a bare number or one of the
/// string encodings ("=5", "201-250", "1001+").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RankText {
    Number(i64),
    Text(String),
}

/// Canonical parsed form of a rank string.
///
/// Invariant: `lower <= upper` whenever both bounds are present. The triple
/// is never persisted as-is; `lower` feeds the catalogue's scalar rank
/// column and the full triple is folded into the auxiliary payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RankValue {
    pub display: Option<String>,
    pub lower: Option<i64>,
    pub upper: Option<i64>,
}

/// Parse heterogeneous rank text into its canonical form. Total: input that
/// matches none of the known encodings keeps its display text and yields
/// empty bounds.
pub fn normalize_rank(raw: Option<&RankText>) -> RankValue {
    let Some(raw) = raw else {
        return RankValue::default();
    };
    match raw {
        RankText::Number(n) => RankValue {
            display: Some(n.to_string()),
            lower: Some(*n),
            upper: Some(*n),
        },
        RankText::Text(s) => normalize_rank_text(s),
    }
}

fn normalize_rank_text(raw: &str) -> RankValue {
    let s = raw.trim();
    if s.is_empty() {
        return RankValue::default();
    }
    // "=5": tie marker, equivalent to the plain number.
    if let Some(rest) = s.strip_prefix('=') {
        if let Ok(n) = rest.trim().parse::<i64>() {
            return RankValue {
                display: Some(format!("={n}")),
                lower: Some(n),
                upper: Some(n),
            };
        }
        return unparsed(s);
    }
    // "1001+": open-ended band, only the lower bound is known.
    if let Some(base) = s.strip_suffix('+') {
        if let Ok(n) = base.trim().parse::<i64>() {
            return RankValue {
                display: Some(format!("{n}+")),
                lower: Some(n),
                upper: None,
            };
        }
        return unparsed(s);
    }
    // "201-250": closed band. An inverted band would break the
    // lower <= upper invariant and is treated as unparseable.
    if let Some((a, b)) = s.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
            if lo <= hi {
                return RankValue {
                    display: Some(format!("{lo}-{hi}")),
                    lower: Some(lo),
                    upper: Some(hi),
                };
            }
        }
        return unparsed(s);
    }
    if let Ok(n) = s.parse::<i64>() {
        return RankValue {
            display: Some(n.to_string()),
            lower: Some(n),
            upper: Some(n),
        };
    }
    unparsed(s)
}

fn unparsed(s: &str) -> RankValue {
    RankValue {
        display: Some(s.to_string()),
        lower: None,
        upper: None,
    }
}

/// An incoming, not-yet-persisted institution observed from a source.
/// Lives only for the duration of one reconciliation call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub initial: Option<String>,
    pub kind: Option<String>,
    pub country: Option<String>,
    pub location: Option<String>,
    pub year_founded: Option<i64>,
    pub rank: Option<RankText>,
    pub website_url: Option<String>,
    pub source_url: Option<String>,
    pub confidence_score: Option<f64>,
    /// Provenance and unparsed upstream fields; merged key-wise into the
    /// stored row's payload on every reconciliation, incoming keys winning.
    pub payload: Map<String, Value>,
    /// Set when the caller already knows the catalogue row. The batch-crawl
    /// path never sets this.
    pub entity_id: Option<Uuid>,
}

/// Persisted catalogue row for an institution awaiting review. Field names
/// double as the store's column names; rows serialize straight onto the
/// REST surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institution {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub year_founded: Option<i64>,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default = "pending_status")]
    pub status: String,
}

/// Initial lifecycle status for crawler-created rows. Review transitions
/// happen outside this pipeline.
pub const STATUS_PENDING: &str = "pending";

fn pending_status() -> String {
    STATUS_PENDING.to_string()
}

/// Crawl job lifecycle. `Running` transitions exactly once, to `Completed`
/// or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_items: u64,
    pub successful_items: u64,
    pub failed_items: u64,
}

/// Persisted job bookkeeping row. Written at batch start and once more at
/// batch end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: JobCounters,
}

/// Result of one reconciliation attempt. `Skipped(None)` marks a candidate
/// whose insert was rejected by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted(Uuid),
    Enriched(Uuid),
    Skipped(Option<Uuid>),
}

/// Aggregated counters for one crawl batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub processed: u64,
    pub inserted: u64,
    pub enriched: u64,
    pub skipped: u64,
    pub failed: u64,
}
