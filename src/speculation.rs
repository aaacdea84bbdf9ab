//! Speculative ID exploration for integer-indexed endpoints.
//!
//! A speculative entry declares what was observed about an endpoint's id
//! space; the engine seeds `[start, ceiling]`, tracks outcomes against the
//! scraper's soft-404 predicate, and extends the ceiling in `plus`-sized
//! windows until `plus` consecutive probes beyond the highest success fail.

use std::collections::HashMap;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db;
use crate::db::state::SpeculationRow;
use crate::error::Result;
use crate::scraper::{EntrySpec, SpeculateConfig, SpeculateMetadata};

/// Tracking state for one speculative entry.
#[derive(Debug, Clone)]
pub struct SpeculationState {
    pub func_name: String,
    pub metadata: SpeculateMetadata,
    pub config: SpeculateConfig,
    pub highest_successful_id: i64,
    pub consecutive_failures: i64,
    pub current_ceiling: i64,
    pub stopped: bool,
}

impl SpeculationState {
    fn plus(&self) -> i64 {
        self.config.plus.unwrap_or(self.metadata.largest_observed_gap).max(1)
    }

    fn seed_range(&self) -> (i64, i64) {
        match self.config.definite_range {
            Some((start, end)) => (start, end),
            None => (1, self.metadata.highest_observed),
        }
    }
}

/// Ids to enqueue as a consequence of an outcome or of seeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedBatch {
    pub entry: String,
    pub ids: Vec<i64>,
}

/// Engine over all speculative entries, shared by the workers.
pub struct SpeculationEngine {
    states: Mutex<HashMap<String, SpeculationState>>,
}

impl SpeculationEngine {
    /// Build tracking state from the scraper's registered entries.
    pub fn discover(entries: &[EntrySpec]) -> Self {
        let mut states = HashMap::new();
        for entry in entries {
            let Some(metadata) = &entry.metadata else {
                continue;
            };
            if !entry.speculative {
                continue;
            }
            states.insert(
                entry.name.clone(),
                SpeculationState {
                    func_name: entry.name.clone(),
                    metadata: metadata.clone(),
                    config: entry.config.clone(),
                    highest_successful_id: 0,
                    consecutive_failures: 0,
                    current_ceiling: 0,
                    stopped: false,
                },
            );
        }
        Self {
            states: Mutex::new(states),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }

    /// Restore persisted tracking state before seeding decides whether any
    /// further extension is warranted.
    pub async fn load_persisted(&self, pool: &SqlitePool) -> Result<()> {
        let rows = db::state::load_speculation_states(pool).await?;
        let mut states = self.states.lock().await;
        for row in rows {
            if let Some(state) = states.get_mut(&row.func_name) {
                state.highest_successful_id = row.highest_successful_id;
                state.consecutive_failures = row.consecutive_failures;
                state.current_ceiling = row.current_ceiling;
                state.stopped = row.stopped;
                debug!(
                    entry = %row.func_name,
                    highest = row.highest_successful_id,
                    ceiling = row.current_ceiling,
                    stopped = row.stopped,
                    "speculation state restored"
                );
            }
        }
        Ok(())
    }

    /// Initial id batches for every entry that is not already stopped.
    /// Advances each ceiling to the end of its seeded range.
    pub async fn seed_batches(&self) -> Vec<SeedBatch> {
        let mut states = self.states.lock().await;
        let mut batches = Vec::new();
        for state in states.values_mut() {
            if state.stopped {
                continue;
            }
            let (start, end) = state.seed_range();
            if end < start {
                continue;
            }
            let ceiling = state.current_ceiling.max(end);
            state.current_ceiling = ceiling;
            batches.push(SeedBatch {
                entry: state.func_name.clone(),
                ids: (start..=end).collect(),
            });
        }
        batches.sort_by(|a, b| a.entry.cmp(&b.entry));
        batches
    }

    /// Record a resolved probe.
    ///
    /// `success` already folds in the scraper's soft-404 predicate. Returns
    /// the extension batch to enqueue, when the success pushed the frontier
    /// near the ceiling.
    pub async fn record_outcome(&self, entry: &str, id: i64, success: bool) -> Option<SeedBatch> {
        let mut states = self.states.lock().await;
        let state = states.get_mut(entry)?;
        let plus = state.plus();

        if success {
            if id > state.highest_successful_id {
                state.highest_successful_id = id;
            }
            state.consecutive_failures = 0;

            if state.stopped {
                return None;
            }
            // Extend when the frontier is within `plus` of the ceiling. The
            // new ceiling is capped at frontier + plus, so the probing window
            // never runs more than `plus` ids past the highest success.
            if state.highest_successful_id >= state.current_ceiling - plus {
                let to = state.highest_successful_id + plus;
                if to > state.current_ceiling {
                    let from = state.current_ceiling + 1;
                    state.current_ceiling = to;
                    info!(entry, from, to, "extending speculation ceiling");
                    return Some(SeedBatch {
                        entry: entry.to_string(),
                        ids: (from..=to).collect(),
                    });
                }
            }
        } else if id > state.highest_successful_id {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= plus && !state.stopped {
                state.stopped = true;
                info!(
                    entry,
                    highest = state.highest_successful_id,
                    failures = state.consecutive_failures,
                    "speculation stopped"
                );
            }
        }
        None
    }

    pub async fn state_of(&self, entry: &str) -> Option<SpeculationState> {
        self.states.lock().await.get(entry).cloned()
    }

    /// Flush all tracking state. Called at close.
    pub async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        let states = self.states.lock().await;
        for state in states.values() {
            db::state::save_speculation_state(
                pool,
                &SpeculationRow {
                    func_name: state.func_name.clone(),
                    highest_successful_id: state.highest_successful_id,
                    consecutive_failures: state.consecutive_failures,
                    current_ceiling: state.current_ceiling,
                    stopped: state.stopped,
                },
            )
            .await?;
        }
        Ok(())
    }
}
