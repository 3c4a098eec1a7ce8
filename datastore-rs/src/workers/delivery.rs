use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::adapter::CollectorAdapter;
use crate::data::{ElementSetEntry, ValueSetEntry, WebServiceEntry};
use crate::fmt::format_duration;
use crate::metadata::MetadataCache;
use crate::metrics::{
    Metrics, BUFFER_RESIDENCE, DELIVERY_CALLS, DELIVERY_FAILURES, DELIVERY_VALUES,
    DELIVERY_VALUE_SETS, END_TO_END, GATHER_DURATION,
};
use crate::settings::Settings;
use crate::store::SharedMap;
use crate::workers::backoff::Backoff;
use crate::workers::pool::TaskPool;
use crate::workers::{Worker, WorkerContext};

/// A value set which has been claimed for delivery.
#[derive(Clone, Debug)]
pub struct Buffered {
    /// The claimed entry.
    pub entry: ValueSetEntry,
    /// The point in time when the entry was put into the buffer.
    pub buffered_at: Instant,
    /// The age of the entry at that point in time.
    pub age: Duration,
}

/// Keeps claimed value sets ordered by their creation time.
///
/// Entries created within the same millisecond are ordered by their store sequence (see
/// [EntryStats::sequence](crate::store::EntryStats::sequence)).
///
/// # Example
///
/// ```
/// # use std::time::Duration;
/// # use datastore::data::{ValueSetEntry, ValueSetRequestEntry};
/// # use datastore::workers::DeliveryBuffer;
/// let entry = |time_stamp: &str| {
///     ValueSetEntry::delivered(
///         ValueSetRequestEntry::new("ws", "flow", "gauges", time_stamp, "base"),
///         vec![1.0, 2.0],
///     )
/// };
///
/// let mut buffer = DeliveryBuffer::default();
/// buffer.push(20, 1, entry("later"), Duration::ZERO);
/// buffer.push(10, 2, entry("sooner"), Duration::ZERO);
///
/// // Four values of 10 bytes each don't fill a packet of 50 bytes...
/// assert_eq!(buffer.take_batch(50, 10, false).is_none(), true);
///
/// // ...but one of 40 bytes, and the oldest entry comes first.
/// let batch = buffer.take_batch(40, 10, false).unwrap();
/// assert_eq!(batch[0].entry.time_stamp(), "sooner");
/// assert_eq!(batch.len(), 2);
/// assert_eq!(buffer.is_empty(), true);
/// ```
#[derive(Default)]
pub struct DeliveryBuffer {
    entries: BTreeMap<(u64, u64), Buffered>,
}

impl DeliveryBuffer {
    /// Adds an entry created at the given time (in milliseconds on the store clock) with the
    /// given store sequence.
    pub fn push(
        &mut self,
        creation_time: u64,
        sequence: u64,
        entry: ValueSetEntry,
        age: Duration,
    ) {
        let _ = self.entries.insert(
            (creation_time, sequence),
            Buffered {
                entry,
                buffered_at: Instant::now(),
                age,
            },
        );
    }

    /// Returns the number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Determines if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the oldest entries once their estimated size reaches the packet size.
    ///
    /// The estimated size of an entry is its number of values times **bytes_per_value**. If
    /// **force** is set, all entries are taken even if they don't fill a packet.
    pub fn take_batch(
        &mut self,
        packet_size: usize,
        bytes_per_value: usize,
        force: bool,
    ) -> Option<Vec<Buffered>> {
        let mut estimated_size = 0;
        let mut count = 0;
        for buffered in self.entries.values() {
            estimated_size += buffered.entry.values().len() * bytes_per_value;
            count += 1;
            if estimated_size >= packet_size {
                break;
            }
        }

        if count == 0 || (estimated_size < packet_size && !force) {
            return None;
        }

        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            match self.entries.pop_first() {
                Some((_, buffered)) => batch.push(buffered),
                None => break,
            }
        }

        Some(batch)
    }
}

/// Hands freshly produced value sets to the collector.
///
/// Each cycle scans the cache for entries which still need to be uploaded. Every such entry is
/// claimed by atomically clearing its flag and then buffered. Once the buffered entries fill a
/// packet (**delivery.packet_size**), the oldest ones are sent to the collector web service
/// (**delivery.collector**) as a single batch. At most **workers.client_count** deliveries run
/// concurrently.
///
/// If there is not enough data, the worker pauses between **delivery.min_backoff** and
/// **delivery.max_backoff**. On shutdown, everything buffered is delivered regardless of its
/// size. Note that a failed delivery is not retried.
pub struct DeliveryWorker {
    context: WorkerContext,
    collector: Arc<dyn CollectorAdapter>,
    pool: TaskPool,
    buffer: DeliveryBuffer,
    backoff: Backoff,
    element_sets: MetadataCache<ElementSetEntry>,
    web_services: MetadataCache<WebServiceEntry>,
}

impl DeliveryWorker {
    /// Creates a new worker which delivers via the given collector adapter.
    pub fn new(context: WorkerContext, collector: Arc<dyn CollectorAdapter>) -> Self {
        let settings = context.settings();
        let store = context.store.clone();

        DeliveryWorker {
            pool: TaskPool::new("delivery", settings.client_count),
            buffer: DeliveryBuffer::default(),
            backoff: Backoff::new(settings.min_backoff, settings.max_backoff),
            element_sets: MetadataCache::with_policy(
                store.element_sets.clone(),
                settings.metadata_ttl,
                settings.metadata_max_entries,
            ),
            web_services: MetadataCache::with_policy(
                store.web_services.clone(),
                settings.metadata_ttl,
                settings.metadata_max_entries,
            ),
            collector,
            context,
        }
    }

    /// Returns the number of claimed but not yet dispatched value sets.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the pause to apply after a cycle which dispatched nothing.
    ///
    /// Consecutive calls double the pause until **delivery.max_backoff** is reached. A cycle
    /// which dispatches a batch starts over with **delivery.min_backoff**.
    pub fn idle_delay(&mut self) -> Duration {
        let settings = self.context.settings();
        self.backoff
            .set_bounds(settings.min_backoff, settings.max_backoff);

        self.backoff.next_delay()
    }

    /// Claims all local value sets which need to be uploaded and buffers them.
    ///
    /// Returns the number of claimed value sets. Only pending entries are copied. An entry
    /// which is written concurrently is skipped and picked up by the next gather, if it still
    /// needs to be uploaded.
    pub async fn gather(&mut self) -> anyhow::Result<usize> {
        let started = Instant::now();
        let value_sets = self.context.store.value_sets.clone();

        let mut gathered = 0;
        for key in value_sets.local_keys().await? {
            match value_sets.entry_stats(&key).await? {
                Some(stats) if stats.needs_upload => (),
                _ => continue,
            }
            let view = match value_sets.entry_view(&key).await? {
                Some(view) if view.stats.needs_upload => view,
                _ => continue,
            };

            let claimed = view.value.claimed();
            if value_sets
                .replace(&key, view.stats.version, claimed.clone())
                .await?
            {
                self.buffer.push(
                    view.stats.creation_time,
                    view.stats.sequence,
                    claimed,
                    view.stats.age,
                );
                gathered += 1;
            }
        }

        self.context
            .metrics
            .add_duration(GATHER_DURATION, started.elapsed());
        if gathered > 0 {
            log::debug!(
                "Gathered {} value set(s) in {} ({} buffered).",
                gathered,
                format_duration(started.elapsed()),
                self.buffer.len()
            );
        }

        Ok(gathered)
    }

    /// Performs a single cycle: gathers and dispatches at most one batch.
    ///
    /// If **force** is set, a batch is dispatched even if it doesn't fill a packet. Returns
    /// **true** if a batch was dispatched.
    pub async fn step(&mut self, force: bool) -> anyhow::Result<bool> {
        let settings = self.context.settings();
        let _ = self.gather().await?;

        match self
            .buffer
            .take_batch(settings.packet_size, settings.bytes_per_value, force)
        {
            Some(batch) => {
                self.dispatch(batch, &settings).await?;
                self.backoff.reset();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dispatch(&mut self, batch: Vec<Buffered>, settings: &Settings) -> anyhow::Result<()> {
        let metrics = self.context.metrics.clone();

        let mut element_sets = HashMap::new();
        let mut entries = Vec::with_capacity(batch.len());
        for buffered in batch {
            let element_set_id = buffered.entry.element_set_id();
            if !element_sets.contains_key(element_set_id) {
                match self.element_sets.lookup(element_set_id).await? {
                    Some(element_set) => {
                        let _ = element_sets.insert(element_set_id.to_owned(), element_set);
                    }
                    None => {
                        log::error!(
                            "Cannot deliver {}: Unknown element set {}",
                            buffered.entry,
                            element_set_id
                        );
                        metrics.add(DELIVERY_FAILURES, 1.);
                        continue;
                    }
                }
            }

            let residence = buffered.buffered_at.elapsed();
            metrics.add_duration(BUFFER_RESIDENCE, residence);
            metrics.add_duration(END_TO_END, buffered.age + residence);
            entries.push(buffered.entry);
        }

        if entries.is_empty() {
            return Ok(());
        }

        let collector = match self.web_services.lookup(&settings.collector).await? {
            Some(collector) => collector,
            None => {
                log::error!(
                    "Cannot deliver {} value set(s): Unknown collector {}",
                    entries.len(),
                    settings.collector
                );
                metrics.add(DELIVERY_FAILURES, 1.);
                return Ok(());
            }
        };
        let url = format!("{}/set", collector.url.trim_end_matches('/'));

        while self.pool.is_saturated() {
            log::debug!("All delivery slots are busy. Waiting...");
            if !self.context.pause(settings.delivery_saturation_delay).await {
                break;
            }
        }
        let permit = self.pool.reserve().await?;

        log::debug!("Delivering {} value set(s) to {}...", entries.len(), url);
        let adapter = self.collector.clone();
        self.pool.spawn(permit, async move {
            deliver(adapter, element_sets, url, entries, metrics).await;
        });

        Ok(())
    }
}

async fn deliver(
    collector: Arc<dyn CollectorAdapter>,
    element_sets: HashMap<String, Arc<ElementSetEntry>>,
    url: String,
    entries: Vec<ValueSetEntry>,
    metrics: Arc<Metrics>,
) {
    let started = Instant::now();
    let result = collector.set_values(&element_sets, &url, &entries).await;
    metrics.add_duration(DELIVERY_CALLS, started.elapsed());

    match result {
        Ok(()) => {
            let values: usize = entries.iter().map(|entry| entry.values().len()).sum();
            metrics.add(DELIVERY_VALUE_SETS, entries.len() as f64);
            metrics.add(DELIVERY_VALUES, values as f64);
        }
        Err(error) => {
            log::error!(
                "Delivering {} value set(s) to {} failed: {:#}",
                entries.len(),
                url,
                error
            );
            metrics.add(DELIVERY_FAILURES, 1.);
        }
    }
}

#[async_trait]
impl Worker for DeliveryWorker {
    fn name(&self) -> &'static str {
        "Delivery worker"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        while self.context.is_running() {
            if self.step(false).await? {
                continue;
            }

            let delay = self.idle_delay();
            if !self.context.pause(delay).await {
                break;
            }
        }

        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        if let Err(error) = self.gather().await {
            log::error!("Failed to gather the remaining value sets: {:#}", error);
        }

        let settings = self.context.settings();
        if !self.buffer.is_empty() {
            log::info!(
                "Delivering {} buffered value set(s) before shutting down...",
                self.buffer.len()
            );
        }
        while let Some(batch) =
            self.buffer
                .take_batch(settings.packet_size, settings.bytes_per_value, true)
        {
            if let Err(error) = self.dispatch(batch, &settings).await {
                log::error!("Failed to deliver buffered value sets: {:#}", error);
            }
        }

        self.pool.shutdown().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mock_instant::MockClock;

    use crate::data::{ValueSetEntry, ValueSetRequestEntry};
    use crate::metrics::{DELIVERY_FAILURES, DELIVERY_VALUE_SETS};
    use crate::settings::Settings;
    use crate::store::SharedMap;
    use crate::testing::test_async;
    use crate::workers::testing::{add_element_set, add_web_service, context, RecordingCollector};
    use crate::workers::{DeliveryWorker, Worker, WorkerContext};

    fn settings() -> Settings {
        Settings {
            // A packet holds exactly three single values...
            packet_size: 3,
            bytes_per_value: 1,
            delivery_saturation_delay: Duration::from_millis(10),
            ..Settings::default()
        }
    }

    async fn setup(
        settings: Settings,
    ) -> (WorkerContext, Arc<RecordingCollector>, DeliveryWorker) {
        let context = context(settings);
        add_element_set(&context, "gauges", &["a"]).await;
        add_web_service(&context, "TestWebService", "http://collector/").await;

        let collector = Arc::new(RecordingCollector::default());
        let worker = DeliveryWorker::new(context.clone(), collector.clone());

        (context, collector, worker)
    }

    async fn produce(context: &WorkerContext, time_stamp: &str) -> ValueSetEntry {
        let entry = ValueSetEntry::new(
            ValueSetRequestEntry::new("ws", "flow", "gauges", time_stamp, "base"),
            vec![1.0],
        );
        context
            .store
            .value_sets
            .put(entry.key(), entry.clone())
            .await
            .unwrap();
        MockClock::advance(Duration::from_millis(10));

        entry
    }

    fn time_stamps(entries: &[ValueSetEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.time_stamp()).collect()
    }

    #[test]
    fn a_full_packet_is_dispatched_in_creation_order() {
        test_async(async {
            let (context, collector, mut worker) = setup(settings()).await;
            let _ = produce(&context, "t1").await;
            let _ = produce(&context, "t2").await;

            // Two values don't fill a packet...
            assert_eq!(worker.step(false).await.unwrap(), false);
            assert_eq!(worker.buffered(), 2);

            let _ = produce(&context, "t3").await;
            assert_eq!(worker.step(false).await.unwrap(), true);
            assert_eq!(worker.buffered(), 0);

            context.shutdown.cancel();
            worker.finish().await.unwrap();

            let batches = collector.batches();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].0, "http://collector/set");
            assert_eq!(time_stamps(&batches[0].1), vec!["t1", "t2", "t3"]);
            assert_eq!(
                batches[0].1.iter().all(|entry| !entry.needs_upload()),
                true
            );
            assert_eq!(context.metrics.get(DELIVERY_VALUE_SETS).sum(), 3.);
        });
    }

    #[test]
    fn nothing_is_dispatched_below_the_packet_size() {
        test_async(async {
            let (context, collector, mut worker) = setup(settings()).await;
            let _ = produce(&context, "t1").await;
            let _ = produce(&context, "t2").await;

            assert_eq!(worker.step(false).await.unwrap(), false);
            assert_eq!(worker.step(false).await.unwrap(), false);
            worker.pool.shutdown().await;

            assert_eq!(collector.batches().len(), 0);
            assert_eq!(worker.buffered(), 2);
        });
    }

    #[test]
    fn claimed_entries_are_gathered_once() {
        test_async(async {
            let (context, _, mut worker) = setup(settings()).await;
            let entry = produce(&context, "t1").await;

            assert_eq!(worker.gather().await.unwrap(), 1);
            assert_eq!(worker.gather().await.unwrap(), 0);

            let cached = context
                .store
                .value_sets
                .get(&entry.key())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(cached.needs_upload(), false);
            assert_eq!(cached.values(), entry.values());

            // A second worker sees the entry as claimed as well...
            let collector = Arc::new(RecordingCollector::default());
            let mut other = DeliveryWorker::new(context.clone(), collector);
            assert_eq!(other.gather().await.unwrap(), 0);
        });
    }

    #[test]
    fn shutdown_delivers_everything_buffered() {
        test_async(async {
            let (context, collector, mut worker) = setup(settings()).await;
            let _ = produce(&context, "t1").await;
            assert_eq!(worker.step(false).await.unwrap(), false);
            let _ = produce(&context, "t2").await;

            // The second entry is only gathered by the final gather...
            context.shutdown.cancel();
            worker.run().await.unwrap();
            worker.finish().await.unwrap();

            let batches = collector.batches();
            assert_eq!(batches.len(), 1);
            assert_eq!(time_stamps(&batches[0].1), vec!["t1", "t2"]);
            assert_eq!(worker.buffered(), 0);
        });
    }

    #[test]
    fn entries_with_unknown_element_sets_are_dropped() {
        test_async(async {
            let (context, collector, mut worker) = setup(settings()).await;
            let orphan = ValueSetEntry::new(
                ValueSetRequestEntry::new("ws", "flow", "unknown", "t0", "base"),
                vec![1.0, 2.0, 3.0],
            );
            context
                .store
                .value_sets
                .put(orphan.key(), orphan)
                .await
                .unwrap();
            MockClock::advance(Duration::from_millis(10));
            let _ = produce(&context, "t1").await;

            assert_eq!(worker.step(true).await.unwrap(), true);
            worker.finish().await.unwrap();

            let batches = collector.batches();
            assert_eq!(batches.len(), 1);
            assert_eq!(time_stamps(&batches[0].1), vec!["t1"]);
            assert_eq!(context.metrics.get(DELIVERY_FAILURES).count(), 1);
        });
    }

    #[test]
    fn an_unknown_collector_drops_the_batch() {
        test_async(async {
            let (context, collector, mut worker) = setup(Settings {
                collector: "Archive".to_owned(),
                ..settings()
            })
            .await;
            let _ = produce(&context, "t1").await;

            assert_eq!(worker.step(true).await.unwrap(), true);
            worker.finish().await.unwrap();

            assert_eq!(collector.batches().len(), 0);
            assert_eq!(context.metrics.get(DELIVERY_FAILURES).count(), 1);
        });
    }

    #[test]
    fn value_sets_containing_nan_are_delivered() {
        test_async(async {
            let (context, collector, mut worker) = setup(settings()).await;
            let entry = ValueSetEntry::new(
                ValueSetRequestEntry::new("ws", "flow", "gauges", "t1", "base"),
                vec![f64::NAN, 1.0, 2.0],
            );
            context
                .store
                .value_sets
                .put(entry.key(), entry.clone())
                .await
                .unwrap();

            assert_eq!(worker.step(false).await.unwrap(), true);
            assert_eq!(worker.gather().await.unwrap(), 0);
            worker.finish().await.unwrap();

            let batches = collector.batches();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].1[0].values()[0].is_nan(), true);
            assert_eq!(
                context
                    .store
                    .value_sets
                    .entry_stats(&entry.key())
                    .await
                    .unwrap()
                    .unwrap()
                    .needs_upload,
                false
            );
        });
    }

    #[test]
    fn entries_of_the_same_millisecond_are_delivered_in_insertion_order() {
        test_async(async {
            let (context, collector, mut worker) = setup(settings()).await;
            for time_stamp in ["t3", "t1", "t2"] {
                let entry = ValueSetEntry::new(
                    ValueSetRequestEntry::new("ws", "flow", "gauges", time_stamp, "base"),
                    vec![1.0],
                );
                context
                    .store
                    .value_sets
                    .put(entry.key(), entry)
                    .await
                    .unwrap();
            }

            assert_eq!(worker.step(false).await.unwrap(), true);
            worker.finish().await.unwrap();

            let batches = collector.batches();
            assert_eq!(time_stamps(&batches[0].1), vec!["t3", "t1", "t2"]);
        });
    }

    #[test]
    fn a_dispatched_batch_resets_the_backoff() {
        test_async(async {
            let (context, _, mut worker) = setup(Settings {
                min_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                ..settings()
            })
            .await;

            // Empty cycles double the pause...
            for expected in [1, 2, 4] {
                assert_eq!(worker.step(false).await.unwrap(), false);
                assert_eq!(worker.idle_delay(), Duration::from_secs(expected));
            }

            for time_stamp in ["t1", "t2", "t3"] {
                let _ = produce(&context, time_stamp).await;
            }
            assert_eq!(worker.step(false).await.unwrap(), true);
            assert_eq!(worker.idle_delay(), Duration::from_secs(1));
            assert_eq!(worker.idle_delay(), Duration::from_secs(2));

            worker.finish().await.unwrap();
        });
    }
}
