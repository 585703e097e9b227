//! Core domain model for MPS: entities, milestone arithmetic, candidates and scan results.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mps-core";

/// Opaque identifier of a tracked entity, stable across runs.
///
/// Remote APIs hand these out as numbers or strings; both deserialize into the
/// same textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(u64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Number(n) => Self::from(n),
            RawId::Text(s) => Self(s),
        })
    }
}

/// A roster entry. Immutable for the lifetime of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub display_name: String,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Cumulative statistic resolved from one successful stats payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub entity: Entity,
    pub cumulative_value: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Smallest multiple of `step` strictly greater than `value`.
///
/// A value sitting exactly on a multiple targets the next one. Returns `None`
/// only when the next multiple does not fit in a `u64`.
pub fn target_milestone(value: u64, step: NonZeroU64) -> Option<u64> {
    let step = step.get();
    (value / step).checked_add(1)?.checked_mul(step)
}

/// Outcome of a milestone evaluation that qualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneHit {
    pub target_milestone: u64,
    pub amount_needed: u64,
}

/// Milestone proximity rule: report entities within `threshold` of their next
/// multiple of `step`, ignoring totals below `min_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneRule {
    pub step: NonZeroU64,
    pub threshold: u64,
    pub min_value: u64,
}

impl MilestoneRule {
    pub fn new(step: NonZeroU64, threshold: u64, min_value: u64) -> Self {
        Self {
            step,
            threshold,
            min_value,
        }
    }

    /// Both bounds are inclusive. Zero totals never qualify.
    pub fn evaluate(&self, value: u64) -> Option<MilestoneHit> {
        if value == 0 || value < self.min_value {
            return None;
        }
        let target = target_milestone(value, self.step)?;
        let amount_needed = target - value;
        (amount_needed <= self.threshold).then_some(MilestoneHit {
            target_milestone: target,
            amount_needed,
        })
    }
}

/// An entity within reach of its next milestone, as written to the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub entity_id: EntityId,
    pub display_name: String,
    pub cumulative_value: u64,
    pub target_milestone: u64,
    pub amount_needed: u64,
    pub stat_type: String,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, String>,
}

impl Candidate {
    pub fn from_snapshot(snapshot: StatSnapshot, hit: MilestoneHit, stat_type: &str) -> Self {
        Self {
            entity_id: snapshot.entity.id,
            display_name: snapshot.entity.display_name,
            cumulative_value: snapshot.cumulative_value,
            target_milestone: hit.target_milestone,
            amount_needed: hit.amount_needed,
            stat_type: stat_type.to_string(),
            metadata: snapshot.metadata,
        }
    }
}

/// Report ordering: most urgent first, then the larger total, then entity id.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    a.amount_needed
        .cmp(&b.amount_needed)
        .then_with(|| b.cumulative_value.cmp(&a.cumulative_value))
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(compare_candidates);
}

/// Totals for one scan run. Built once, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub run_id: Uuid,
    pub source_id: String,
    pub stat_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Distinct entities after deduplication.
    pub roster_size: usize,
    pub duplicate_count: usize,
    pub processed_count: usize,
    pub failure_count: usize,
    pub suppressed_count: usize,
    /// Entities never started because the run was cancelled.
    pub skipped_count: usize,
    pub candidates: Vec<Candidate>,
}

impl ScanResult {
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// True when every scheduled entity is counted exactly once.
    pub fn is_fully_accounted(&self) -> bool {
        self.processed_count == self.candidates.len() + self.suppressed_count + self.failure_count
            && self.roster_size == self.processed_count + self.skipped_count
    }

    pub fn was_cancelled(&self) -> bool {
        self.skipped_count > 0
    }
}
