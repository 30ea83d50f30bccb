//! Execution plan: the ordered `(query, bucket)` pairs that decide which window each
//! dispatch targets, and the per-query cycler that walks them forever.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::bucket::BucketRegistry;
use super::query::QueryTemplate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub query_name: String,
    pub bucket_name: String,
}

impl PlanEntry {
    pub fn new(query_name: impl Into<String>, bucket_name: impl Into<String>) -> Self {
        Self {
            query_name: query_name.into(),
            bucket_name: bucket_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("execution plan is empty")]
    Empty,

    #[error("execution plan entry #{index} references undefined query '{query}'")]
    UnknownQuery { index: usize, query: String },

    #[error("execution plan entry #{index} references undefined bucket '{bucket}' (query '{query}')")]
    UnknownBucket {
        index: usize,
        query: String,
        bucket: String,
    },

    #[error("query '{0}' has no execution plan entries")]
    NoEntries(String),
}

/// The full, process-wide plan as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    entries: Vec<PlanEntry>,
}

impl ExecutionPlan {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Checks every entry against the declared queries and buckets, then splits the plan
    /// into one ordered sub-plan per query, preserving the original relative order.
    pub fn partition(
        &self,
        queries: &[QueryTemplate],
        registry: &BucketRegistry,
    ) -> Result<HashMap<String, QueryPlan>, PlanError> {
        if self.entries.is_empty() {
            return Err(PlanError::Empty);
        }

        let declared: HashSet<&str> = queries.iter().map(|q| q.name.as_str()).collect();
        let mut per_query: HashMap<String, Vec<PlanEntry>> = HashMap::new();

        for (index, entry) in self.entries.iter().enumerate() {
            if !declared.contains(entry.query_name.as_str()) {
                return Err(PlanError::UnknownQuery {
                    index,
                    query: entry.query_name.clone(),
                });
            }
            if !registry.contains(&entry.bucket_name) {
                return Err(PlanError::UnknownBucket {
                    index,
                    query: entry.query_name.clone(),
                    bucket: entry.bucket_name.clone(),
                });
            }
            per_query
                .entry(entry.query_name.clone())
                .or_default()
                .push(entry.clone());
        }

        queries
            .iter()
            .map(|q| {
                let entries = per_query
                    .remove(&q.name)
                    .ok_or_else(|| PlanError::NoEntries(q.name.clone()))?;
                Ok((q.name.clone(), QueryPlan::new(q.name.clone(), entries)?))
            })
            .collect()
    }
}

/// One step of a query's plan, as handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep<'a> {
    /// Global position in the infinite sequence (the cursor value consumed).
    pub sequence: u64,
    pub entry: &'a PlanEntry,
}

impl PlanStep<'_> {
    /// True on the first step of every pass after the first.
    pub fn starts_new_cycle(&self, plan_len: usize) -> bool {
        self.sequence > 0 && self.sequence % plan_len as u64 == 0
    }
}

/// Infinite, cycling view of one query's plan entries.
///
/// The cursor is owned by the plan and shared (behind an `Arc`) by all workers of the
/// query's executor. Every call to [`QueryPlan::next`] consumes exactly one cursor value.
#[derive(Debug)]
pub struct QueryPlan {
    query_name: String,
    entries: Vec<PlanEntry>,
    cursor: AtomicU64,
}

impl QueryPlan {
    pub fn new(query_name: String, entries: Vec<PlanEntry>) -> Result<Self, PlanError> {
        if entries.is_empty() {
            return Err(PlanError::NoEntries(query_name));
        }
        Ok(Self {
            query_name,
            entries,
            cursor: AtomicU64::new(0),
        })
    }

    pub fn query_name(&self) -> &str {
        &self.query_name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Number of steps handed out so far.
    pub fn dispatched(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn next(&self) -> PlanStep<'_> {
        let sequence = self.cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (sequence % self.entries.len() as u64) as usize;
        PlanStep {
            sequence,
            entry: &self.entries[idx],
        }
    }

    /// Number of entries per bucket in one pass of the plan.
    pub fn distribution(&self) -> BTreeMap<&str, usize> {
        let mut dist = BTreeMap::new();
        for entry in &self.entries {
            *dist.entry(entry.bucket_name.as_str()).or_insert(0) += 1;
        }
        dist
    }
}
