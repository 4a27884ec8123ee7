//! In-memory result cache keyed by the derived request key.
//!
//! Entries live for a fixed TTL. Lookups can be exact (same table, same
//! normalized prompt) or fuzzy (best prompt similarity on the same table).
//! The cache holds at most `capacity` entries; inserting past that evicts
//! the oldest one.

use crate::config::CacheConfig;
use crate::models::{derive_key, QueryResult};
use crate::similarity;
use crate::util::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub result: QueryResult,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    /// Insertion order, breaks ties between equal `cached_at`.
    #[serde(skip)]
    seq: u64,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Older first: by `cached_at`, then by insertion order.
    fn age_order(&self, other: &Self) -> Ordering {
        self.cached_at
            .cmp(&other.cached_at)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarHit {
    pub id: String,
    pub result: QueryResult,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_hits: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, CacheEntry>,
    next_seq: u64,
}

pub struct SemanticCache {
    entries: Mutex<Entries>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl SemanticCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            ttl,
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(Duration::minutes(config.ttl_minutes), config.max_entries, clock)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Exact lookup. Expired entries found on the way are dropped.
    pub fn get(&self, table_name: &str, prompt: &str) -> Result<Option<QueryResult>, CacheError> {
        let id = derive_key(table_name, prompt);
        let now = self.clock.now();
        let mut entries = self.lock()?;

        match entries.by_id.get_mut(&id) {
            Some(entry) if entry.is_live(now) => {
                entry.hit_count += 1;
                return Ok(Some(entry.result.clone()));
            }
            Some(_) => {}
            None => return Ok(None),
        }

        debug!("Dropping expired cache entry {}", id);
        entries.by_id.remove(&id);
        Ok(None)
    }

    /// Best live entry on `table_name` whose prompt scores at least
    /// `threshold` against `prompt`. Equal scores go to the older entry.
    pub fn get_similar(
        &self,
        table_name: &str,
        prompt: &str,
        threshold: f64,
    ) -> Result<Option<SimilarHit>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;

        let mut best: Option<(&String, f64, u64)> = None;
        for (id, entry) in &entries.by_id {
            if !entry.is_live(now) || entry.result.table_name != table_name {
                continue;
            }
            let score = similarity::score(prompt, &entry.result.natural_language_query);
            if score < threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_score, best_seq)) => {
                    score > best_score || (score == best_score && entry.seq < best_seq)
                }
            };
            if better {
                best = Some((id, score, entry.seq));
            }
        }

        let Some((id, score, _)) = best else {
            return Ok(None);
        };
        let id = id.clone();

        let Some(entry) = entries.by_id.get_mut(&id) else {
            return Ok(None);
        };
        entry.hit_count += 1;
        debug!("Similar cache hit {} (score {:.3})", id, score);
        Ok(Some(SimilarHit {
            id,
            result: entry.result.clone(),
            similarity: score,
        }))
    }

    /// Stores `result` under its derived key. A live entry with the same key
    /// is kept as is and only counts a hit; an expired one is replaced.
    pub fn put(&self, result: QueryResult) -> Result<CacheEntry, CacheError> {
        let id = result.key();
        let now = self.clock.now();
        let mut entries = self.lock()?;

        if let Some(existing) = entries.by_id.get_mut(&id) {
            if existing.is_live(now) {
                existing.hit_count += 1;
                return Ok(existing.clone());
            }
        }

        let seq = entries.next_seq;
        entries.next_seq += 1;
        let entry = CacheEntry {
            id: id.clone(),
            result,
            cached_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
            seq,
        };
        entries.by_id.insert(id, entry.clone());

        while entries.by_id.len() > self.capacity {
            let Some(oldest) = entries
                .by_id
                .values()
                .min_by(|a, b| a.age_order(b))
                .map(|e| e.id.clone())
            else {
                break;
            };
            debug!("Evicting cache entry {}", oldest);
            entries.by_id.remove(&oldest);
        }

        Ok(entry)
    }

    /// Removes every entry whose `expires_at` has passed. Returns how many.
    pub fn sweep_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let before = entries.by_id.len();
        entries.by_id.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.by_id.len())
    }

    /// Live entry by id, without counting a hit.
    pub fn get_by_id(&self, id: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(entries
            .by_id
            .get(id)
            .filter(|entry| entry.is_live(now))
            .cloned())
    }

    /// Live entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let entries = self.lock()?;
        let mut live: Vec<CacheEntry> = entries
            .by_id
            .values()
            .filter(|entry| entry.is_live(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| b.age_order(a));
        live.truncate(limit);
        Ok(live)
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.by_id.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.lock()?;
        let values = entries.by_id.values();
        Ok(CacheStats {
            entries: entries.by_id.len(),
            total_hits: values.clone().map(|e| e.hit_count).sum(),
            oldest: values.clone().map(|e| e.cached_at).min(),
            newest: values.map(|e| e.cached_at).max(),
        })
    }
}
