use std::time::Instant;

use async_trait::async_trait;

use crate::fmt::format_size;
use crate::metrics::{EVICTED_BYTES, EVICTED_VALUE_SETS};
use crate::store::SharedMap;
use crate::workers::{Worker, WorkerContext};

/// Describes a cache entry which may be evicted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// The key of the entry.
    pub key: String,
    /// The creation time of the entry in milliseconds on the store clock.
    pub creation_time: u64,
    /// The store sequence of the entry, which orders entries created within the same
    /// millisecond.
    pub sequence: u64,
    /// The version of the entry when it was inspected. The entry is only removed if it hasn't
    /// been written since.
    pub version: u64,
    /// The memory cost of the entry in bytes.
    pub cost: usize,
}

/// Summarizes a single eviction sweep.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    /// The number of removed entries.
    pub evicted: usize,
    /// The number of reclaimed bytes.
    pub reclaimed: usize,
}

/// Selects the oldest candidates until their summed cost reaches the given budget.
///
/// Candidates are ordered by creation time only, so that a frequently read but old entry is
/// evicted before a younger one.
///
/// # Example
///
/// ```
/// # use datastore::workers::{select_victims, Candidate};
/// let candidates = (1..=5)
///     .rev()
///     .map(|age| Candidate {
///         key: format!("e{}", age),
///         creation_time: age,
///         sequence: age,
///         version: 1,
///         cost: 3,
///     })
///     .collect();
///
/// let keys: Vec<String> = select_victims(candidates, 9).into_iter().map(|c| c.key).collect();
/// assert_eq!(keys, vec!["e1", "e2", "e3"]);
/// ```
pub fn select_victims(mut candidates: Vec<Candidate>, budget: usize) -> Vec<Candidate> {
    candidates.sort_by_key(|candidate| (candidate.creation_time, candidate.sequence));

    let mut selected = 0;
    let mut victims = Vec::new();
    for candidate in candidates {
        if selected >= budget {
            break;
        }
        selected += candidate.cost;
        victims.push(candidate);
    }

    victims
}

/// Keeps the cache below its memory limit.
///
/// Every **eviction.interval** the worker compares the local memory cost of the cache with
/// **store.max_memory**. Once the fill ratio exceeds **eviction.threshold**, the oldest entries
/// are removed until **eviction.reclaim_ratio** of the current cost is reclaimed.
///
/// Entries which still need to be delivered and entries which have never been read are never
/// evicted. This also holds for an entry which is overwritten while a sweep is running.
pub struct EvictionWorker {
    context: WorkerContext,
}

impl EvictionWorker {
    /// Creates a new worker.
    pub fn new(context: WorkerContext) -> Self {
        EvictionWorker { context }
    }

    /// Performs a single sweep.
    pub async fn sweep(&mut self) -> anyhow::Result<Sweep> {
        let settings = self.context.settings();
        let value_sets = self.context.store.value_sets.as_ref();

        let cost = value_sets.local_memory_cost().await?;
        let percent_full = if settings.max_memory == 0 {
            if cost > 0 {
                f64::INFINITY
            } else {
                0.
            }
        } else {
            cost as f64 / settings.max_memory as f64
        };
        if percent_full <= settings.eviction_threshold {
            log::debug!(
                "The cache uses {} of {} ({:.1}%). Nothing to evict.",
                format_size(cost),
                format_size(settings.max_memory),
                percent_full * 100.
            );
            return Ok(Sweep::default());
        }

        let started = Instant::now();
        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            log::warn!(
                "The cache uses {} of {} but contains no evictable entries.",
                format_size(cost),
                format_size(settings.max_memory)
            );
            return Ok(Sweep::default());
        }

        let budget = ((cost as f64 * settings.reclaim_ratio) as usize).max(1);
        let sweep = self.evict(select_victims(candidates, budget)).await?;

        self.context
            .metrics
            .add(EVICTED_VALUE_SETS, sweep.evicted as f64);
        self.context
            .metrics
            .add(EVICTED_BYTES, sweep.reclaimed as f64);
        log::info!(
            "Evicted {} value set(s) and reclaimed {} of {} in {}.",
            sweep.evicted,
            format_size(sweep.reclaimed),
            format_size(cost),
            crate::fmt::format_duration(started.elapsed())
        );

        Ok(sweep)
    }

    async fn candidates(&self) -> anyhow::Result<Vec<Candidate>> {
        let value_sets = self.context.store.value_sets.as_ref();

        let mut candidates = Vec::new();
        for key in value_sets.local_keys().await? {
            if let Some(stats) = value_sets.entry_stats(&key).await? {
                if !stats.needs_upload && stats.hits > 0 {
                    candidates.push(Candidate {
                        key,
                        creation_time: stats.creation_time,
                        sequence: stats.sequence,
                        version: stats.version,
                        cost: stats.cost,
                    });
                }
            }
        }

        Ok(candidates)
    }

    async fn evict(&self, victims: Vec<Candidate>) -> anyhow::Result<Sweep> {
        let value_sets = self.context.store.value_sets.as_ref();

        let mut sweep = Sweep::default();
        for victim in victims {
            if value_sets
                .remove_if_unchanged(&victim.key, victim.version)
                .await?
            {
                sweep.evicted += 1;
                sweep.reclaimed += victim.cost;
            } else {
                log::debug!("{} changed during the sweep and is kept.", victim.key);
            }
        }

        Ok(sweep)
    }
}

#[async_trait]
impl Worker for EvictionWorker {
    fn name(&self) -> &'static str {
        "Eviction worker"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        while self.context.is_running() {
            let _ = self.sweep().await?;

            let interval = self.context.settings().eviction_interval;
            if !self.context.pause(interval).await {
                break;
            }
        }

        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mock_instant::MockClock;

    use crate::data::{ValueSetEntry, ValueSetRequestEntry};
    use crate::metrics::EVICTED_VALUE_SETS;
    use crate::settings::Settings;
    use crate::store::SharedMap;
    use crate::testing::test_async;
    use crate::workers::testing::context;
    use crate::workers::{select_victims, Candidate, EvictionWorker, Sweep};

    #[test]
    fn the_oldest_candidates_are_selected_until_the_budget_is_met() {
        // Five entries of age 1 (oldest) to 5, 3 bytes each and 10% of 95 bytes to reclaim...
        let candidates: Vec<Candidate> = vec![4, 2, 5, 1, 3]
            .into_iter()
            .map(|age| Candidate {
                key: format!("age{}", age),
                creation_time: age,
                sequence: 10 - age,
                version: 1,
                cost: 3,
            })
            .collect();

        let victims = select_victims(candidates, 95 / 10);
        assert_eq!(
            victims.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
            vec!["age1", "age2", "age3"]
        );
        assert_eq!(victims.iter().map(|c| c.cost).sum::<usize>(), 9);
    }

    #[test]
    fn candidates_of_the_same_millisecond_are_ordered_by_sequence() {
        let candidates: Vec<Candidate> = vec![3, 1, 2]
            .into_iter()
            .map(|sequence| Candidate {
                key: format!("z{}", sequence),
                creation_time: 42,
                sequence,
                version: 1,
                cost: 1,
            })
            .collect();

        let victims = select_victims(candidates, 2);
        assert_eq!(
            victims.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
            vec!["z1", "z2"]
        );
    }

    #[test]
    fn nothing_is_selected_without_candidates() {
        assert_eq!(select_victims(Vec::new(), 100).is_empty(), true);
    }

    fn value_set(time_stamp: &str, needs_upload: bool) -> ValueSetEntry {
        let id = ValueSetRequestEntry::new("ws", "flow", "gauges", time_stamp, "base");
        if needs_upload {
            ValueSetEntry::new(id, vec![1., 2.])
        } else {
            ValueSetEntry::delivered(id, vec![1., 2.])
        }
    }

    #[test]
    fn only_delivered_and_read_entries_are_evicted() {
        test_async(async {
            let context = context(Settings {
                max_memory: 10,
                eviction_threshold: 0.9,
                reclaim_ratio: 0.5,
                ..Settings::default()
            });
            let value_sets = context.store.value_sets.clone();

            let pending = value_set("t1", true);
            let unread = value_set("t2", false);
            let old = value_set("t3", false);
            let young = value_set("t4", false);
            for entry in [&pending, &unread, &old, &young] {
                value_sets.put(entry.key(), entry.clone()).await.unwrap();
                MockClock::advance(Duration::from_millis(10));
            }

            // Read every entry except the unread one...
            for entry in [&pending, &old, &young] {
                let _ = value_sets.get(&entry.key()).await.unwrap();
            }

            // All four entries cost the same, so half of the cost is reclaimed by two entries.
            // As the pending and unread ones are protected, only old and young remain...
            let mut worker = EvictionWorker::new(context.clone());
            let sweep = worker.sweep().await.unwrap();
            assert_eq!(sweep.evicted, 2);

            assert_eq!(value_sets.contains_key(&pending.key()).await.unwrap(), true);
            assert_eq!(value_sets.contains_key(&unread.key()).await.unwrap(), true);
            assert_eq!(value_sets.contains_key(&old.key()).await.unwrap(), false);
            assert_eq!(value_sets.contains_key(&young.key()).await.unwrap(), false);
            assert_eq!(context.metrics.get(EVICTED_VALUE_SETS).sum(), 2.);
        });
    }

    #[test]
    fn the_oldest_entry_is_evicted_first() {
        test_async(async {
            let context = context(Settings {
                max_memory: 10,
                reclaim_ratio: 0.01,
                ..Settings::default()
            });
            let value_sets = context.store.value_sets.clone();

            let old = value_set("t1", false);
            let young = value_set("t2", false);
            for entry in [&old, &young] {
                value_sets.put(entry.key(), entry.clone()).await.unwrap();
                MockClock::advance(Duration::from_millis(10));
            }
            // A frequently read entry is not protected...
            for _ in 0..10 {
                let _ = value_sets.get(&old.key()).await.unwrap();
            }
            let _ = value_sets.get(&young.key()).await.unwrap();

            let mut worker = EvictionWorker::new(context.clone());
            assert_eq!(worker.sweep().await.unwrap().evicted, 1);
            assert_eq!(value_sets.contains_key(&old.key()).await.unwrap(), false);
            assert_eq!(value_sets.contains_key(&young.key()).await.unwrap(), true);
        });
    }

    #[test]
    fn nothing_is_evicted_below_the_threshold() {
        test_async(async {
            let context = context(Settings::default());
            let entry = value_set("t1", false);
            context
                .store
                .value_sets
                .put(entry.key(), entry.clone())
                .await
                .unwrap();
            let _ = context.store.value_sets.get(&entry.key()).await.unwrap();

            let mut worker = EvictionWorker::new(context.clone());
            assert_eq!(worker.sweep().await.unwrap(), Sweep::default());
            assert_eq!(
                context.store.value_sets.contains_key(&entry.key()).await.unwrap(),
                true
            );
        });
    }

    #[test]
    fn a_cache_without_candidates_is_left_alone() {
        test_async(async {
            let context = context(Settings {
                max_memory: 1,
                ..Settings::default()
            });
            let entry = value_set("t1", true);
            context
                .store
                .value_sets
                .put(entry.key(), entry.clone())
                .await
                .unwrap();
            let _ = context.store.value_sets.get(&entry.key()).await.unwrap();

            let mut worker = EvictionWorker::new(context.clone());
            assert_eq!(worker.sweep().await.unwrap(), Sweep::default());
            assert_eq!(context.store.value_sets.local_memory_cost().await.unwrap() > 0, true);
        });
    }

    #[test]
    fn a_cache_at_95_percent_is_swept_down_by_the_reclaim_ratio() {
        test_async(async {
            let context = context(Settings::default());
            let value_sets = context.store.value_sets.clone();

            // Five delivered and read entries of equal cost, the oldest one first...
            let candidates: Vec<ValueSetEntry> = (1..=5)
                .map(|age| value_set(&format!("t{}", age), false))
                .collect();
            for entry in &candidates {
                value_sets.put(entry.key(), entry.clone()).await.unwrap();
                let _ = value_sets.get(&entry.key()).await.unwrap();
                MockClock::advance(Duration::from_millis(10));
            }
            let candidate_cost = value_sets.local_memory_cost().await.unwrap() / 5;

            // ...plus a pending entry which makes up about 20 times the cost of a candidate, so
            // that 10% of the total cost is covered by exactly three candidates.
            let pending_values = 20 * candidate_cost / std::mem::size_of::<f64>();
            let pending = ValueSetEntry::new(
                ValueSetRequestEntry::new("ws", "flow", "gauges", "t6", "base"),
                vec![1.0; pending_values],
            );
            value_sets.put(pending.key(), pending.clone()).await.unwrap();
            let _ = value_sets.get(&pending.key()).await.unwrap();

            let cost = value_sets.local_memory_cost().await.unwrap();
            context.settings.update(Settings {
                max_memory: cost * 100 / 95,
                eviction_threshold: 0.9,
                reclaim_ratio: 0.1,
                ..Settings::default()
            });

            let mut worker = EvictionWorker::new(context.clone());
            let sweep = worker.sweep().await.unwrap();
            assert_eq!(sweep.evicted, 3);
            assert_eq!(sweep.reclaimed, 3 * candidate_cost);
            assert_eq!(sweep.reclaimed >= cost / 10, true);

            for (index, entry) in candidates.iter().enumerate() {
                assert_eq!(
                    value_sets.contains_key(&entry.key()).await.unwrap(),
                    index >= 3
                );
            }
            assert_eq!(value_sets.contains_key(&pending.key()).await.unwrap(), true);
        });
    }

    #[test]
    fn entries_written_during_a_sweep_are_kept() {
        test_async(async {
            let context = context(Settings {
                max_memory: 1,
                ..Settings::default()
            });
            let value_sets = context.store.value_sets.clone();
            let entry = value_set("t1", false);
            value_sets.put(entry.key(), entry.clone()).await.unwrap();
            let _ = value_sets.get(&entry.key()).await.unwrap();

            let worker = EvictionWorker::new(context.clone());
            let candidates = worker.candidates().await.unwrap();
            assert_eq!(candidates.len(), 1);

            // A fresh value arrives after the candidates have been selected...
            let fresh = value_set("t1", true);
            value_sets.put(fresh.key(), fresh.clone()).await.unwrap();

            assert_eq!(worker.evict(candidates).await.unwrap(), Sweep::default());
            assert_eq!(value_sets.get(&entry.key()).await.unwrap(), Some(fresh));
        });
    }
}
