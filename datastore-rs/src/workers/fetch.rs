use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;

use crate::adapter::{AdapterFactory, FetchAdapter};
use crate::data::{ElementSetEntry, ValueSetEntry, ValueSetRequestEntry, WebServiceEntry};
use crate::metadata::MetadataCache;
use crate::metrics::{
    Metrics, ADMISSION_WAITS, ASSEMBLED_VALUE_SETS, DEDUP_DROPS, FETCH_CALLS, FETCH_FAILURES,
    FETCH_VALUES, FETCH_VALUE_SETS,
};
use crate::settings::Settings;
use crate::store::{max_data_exceeded, SharedMap};
use crate::workers::assembly::try_assemble;
use crate::workers::history::RequestHistory;
use crate::workers::pool::TaskPool;
use crate::workers::{Worker, WorkerContext};

/// Describes what happened to a request taken from the queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The request was handled recently and has been dropped.
    Duplicate,
    /// The value set is already cached and the request has been dropped.
    Cached,
    /// The value set has been assembled from cached value sets.
    Assembled,
    /// A web service call has been started in the background.
    Dispatched,
    /// The request could not be handled (e.g. unknown metadata) and has been dropped.
    Failed,
}

/// Turns requested value sets into cached ones.
///
/// Each request is first checked against the history of recently handled requests and against
/// the cache. If enabled, the worker then tries to assemble the value set from cached ones.
/// Otherwise the value set is fetched from its web service in the background. At most
/// **workers.client_count** web service calls run concurrently.
///
/// Adapters are created on first use of a web service and stopped when the worker shuts down.
pub struct FetchWorker {
    context: WorkerContext,
    factory: Arc<dyn AdapterFactory>,
    pool: TaskPool,
    history: RequestHistory,
    element_sets: MetadataCache<ElementSetEntry>,
    web_services: MetadataCache<WebServiceEntry>,
    adapters: HashMap<String, Arc<dyn FetchAdapter>>,
}

impl FetchWorker {
    /// Creates a new worker which uses the given factory to create its adapters.
    ///
    /// The pool size, the depth of the history and the metadata cache policy are taken from
    /// the current settings.
    pub fn new(context: WorkerContext, factory: Arc<dyn AdapterFactory>) -> Self {
        let settings = context.settings();
        let store = context.store.clone();

        FetchWorker {
            pool: TaskPool::new("fetch", settings.client_count),
            history: RequestHistory::new(settings.client_count),
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
            adapters: HashMap::new(),
            factory,
            context,
        }
    }

    /// Performs a single cycle: waits for a free slot and free capacity, then handles at most
    /// one request.
    ///
    /// Returns what happened to the request or **None** if no request was taken.
    pub async fn step(&mut self) -> anyhow::Result<Option<FetchOutcome>> {
        let settings = self.context.settings();

        if self.pool.is_saturated() {
            log::debug!("All fetch slots are busy. Pausing fetch...");
            let _ = self.context.pause(settings.saturation_delay).await;
            return Ok(None);
        }
        let permit = tokio::select! {
            _ = self.context.shutdown.cancelled() => return Ok(None),
            permit = self.pool.reserve() => permit?,
        };

        if max_data_exceeded(self.context.store.value_sets.as_ref(), settings.max_memory).await {
            log::debug!("The cache is full. Pausing fetch...");
            let started = Instant::now();
            let _ = self.context.pause(settings.capacity_delay).await;
            self.context
                .metrics
                .add_duration(ADMISSION_WAITS, started.elapsed());
            return Ok(None);
        }

        let request = tokio::select! {
            _ = self.context.shutdown.cancelled() => return Ok(None),
            request = self.context.store.value_set_requests.poll(settings.poll_timeout) => request?,
        };

        match request {
            Some(request) => Ok(Some(self.handle(request, &settings, permit).await?)),
            None => Ok(None),
        }
    }

    async fn handle(
        &mut self,
        request: ValueSetRequestEntry,
        settings: &Settings,
        permit: OwnedSemaphorePermit,
    ) -> anyhow::Result<FetchOutcome> {
        let key = request.key();
        if self.history.contains(&key) {
            log::debug!("Dropping {} as it has been requested recently.", request);
            self.context.metrics.add(DEDUP_DROPS, 1.);
            return Ok(FetchOutcome::Duplicate);
        }
        if self.context.store.value_sets.contains_key(&key).await? {
            log::debug!("Dropping {} as it is already cached.", request);
            self.context.metrics.add(DEDUP_DROPS, 1.);
            return Ok(FetchOutcome::Cached);
        }
        self.history.remember(key.clone());

        let element_set = match self.element_sets.lookup(&request.element_set_id).await? {
            Some(element_set) => element_set,
            None => {
                log::error!(
                    "Cannot fetch {}: Unknown element set {}",
                    request,
                    request.element_set_id
                );
                self.context.metrics.add(FETCH_FAILURES, 1.);
                return Ok(FetchOutcome::Failed);
            }
        };

        if settings.enable_assembly {
            let known: Vec<Arc<ElementSetEntry>> = self
                .element_sets
                .iter()
                .map(|(_, element_set)| element_set.clone())
                .collect();
            if let Some(entry) = try_assemble(
                &request,
                &element_set,
                &known,
                self.context.store.value_sets.as_ref(),
            )
            .await?
            {
                log::debug!("Assembled {} from cached value sets.", request);
                self.context.store.value_sets.put(key, entry).await?;
                self.context.metrics.add(ASSEMBLED_VALUE_SETS, 1.);
                return Ok(FetchOutcome::Assembled);
            }
        }

        let cached_adapter = self.adapters.get(&request.web_service_id).cloned();
        let adapter = match cached_adapter {
            Some(adapter) => adapter,
            None => match self.start_adapter(&request.web_service_id).await? {
                Some(adapter) => adapter,
                None => {
                    self.context.metrics.add(FETCH_FAILURES, 1.);
                    return Ok(FetchOutcome::Failed);
                }
            },
        };

        self.dispatch(request, element_set, adapter, permit);
        Ok(FetchOutcome::Dispatched)
    }

    async fn start_adapter(
        &mut self,
        web_service_id: &str,
    ) -> anyhow::Result<Option<Arc<dyn FetchAdapter>>> {
        let web_service = match self.web_services.lookup(web_service_id).await? {
            Some(web_service) => web_service,
            None => {
                log::error!("Cannot fetch from unknown web service {}", web_service_id);
                return Ok(None);
            }
        };

        let adapter = match self.factory.create(&web_service) {
            Ok(adapter) => adapter,
            Err(error) => {
                log::error!("Cannot create an adapter for {}: {:#}", web_service, error);
                return Ok(None);
            }
        };

        if let Err(error) = adapter.start().await {
            log::error!("Failed to start the adapter for {}: {:#}", web_service, error);
            return Ok(None);
        }

        log::info!("Started the adapter for {}.", web_service);
        let _ = self
            .adapters
            .insert(web_service_id.to_owned(), adapter.clone());

        Ok(Some(adapter))
    }

    fn dispatch(
        &mut self,
        request: ValueSetRequestEntry,
        element_set: Arc<ElementSetEntry>,
        adapter: Arc<dyn FetchAdapter>,
        permit: OwnedSemaphorePermit,
    ) {
        let value_sets = self.context.store.value_sets.clone();
        let metrics = self.context.metrics.clone();

        self.pool.spawn(permit, async move {
            fetch(request, element_set, adapter, value_sets, metrics).await;
        });
    }
}

async fn fetch(
    request: ValueSetRequestEntry,
    element_set: Arc<ElementSetEntry>,
    adapter: Arc<dyn FetchAdapter>,
    value_sets: Arc<dyn SharedMap<ValueSetEntry>>,
    metrics: Arc<Metrics>,
) {
    let started = Instant::now();
    let result = adapter
        .get_values(
            &request.quantity_id,
            element_set.element_ids(),
            &request.time_stamp,
        )
        .await;
    metrics.add_duration(FETCH_CALLS, started.elapsed());

    let values = match result {
        Ok(values) if values.len() == element_set.len() => values,
        Ok(values) => {
            log::error!(
                "Fetching {} yielded {} values but {} were expected.",
                request,
                values.len(),
                element_set.len()
            );
            metrics.add(FETCH_FAILURES, 1.);
            return;
        }
        Err(error) => {
            log::error!("Fetching {} failed: {:#}", request, error);
            metrics.add(FETCH_FAILURES, 1.);
            return;
        }
    };

    let value_count = values.len();
    let entry = ValueSetEntry::new(request, values);
    match value_sets.put(entry.key(), entry).await {
        Ok(()) => {
            metrics.add(FETCH_VALUE_SETS, 1.);
            metrics.add(FETCH_VALUES, value_count as f64);
        }
        Err(error) => log::error!("Failed to store a fetched value set: {:#}", error),
    }
}

#[async_trait]
impl Worker for FetchWorker {
    fn name(&self) -> &'static str {
        "Fetch worker"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        while self.context.is_running() {
            let _ = self.step().await?;
        }

        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        match self.context.store.value_set_requests.len().await {
            Ok(0) => (),
            Ok(remaining) => log::warn!(
                "The fetch worker stops with {} request(s) left in its queue.",
                remaining
            ),
            Err(error) => log::warn!("Failed to determine the pending requests: {:#}", error),
        }

        self.pool.shutdown().await;

        let adapters: Vec<(String, Arc<dyn FetchAdapter>)> = self.adapters.drain().collect();
        let results = futures::future::join_all(
            adapters.iter().map(|(_, adapter)| adapter.stop()),
        )
        .await;
        for ((web_service_id, _), result) in adapters.iter().zip(results) {
            if let Err(error) = result {
                log::error!(
                    "Failed to stop the adapter for {}: {:#}",
                    web_service_id,
                    error
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::data::{ValueSetEntry, ValueSetRequestEntry};
    use crate::metrics::{ADMISSION_WAITS, ASSEMBLED_VALUE_SETS, DEDUP_DROPS, FETCH_FAILURES};
    use crate::settings::Settings;
    use crate::store::{SharedMap, SharedQueue};
    use crate::testing::test_async;
    use crate::workers::testing::{
        add_element_set, add_web_service, context, RecordingAdapter, SingleAdapterFactory,
    };
    use crate::workers::{FetchOutcome, FetchWorker, Worker, WorkerContext};

    fn settings() -> Settings {
        Settings {
            poll_timeout: Duration::from_millis(10),
            capacity_delay: Duration::from_millis(10),
            saturation_delay: Duration::from_millis(10),
            client_count: 2,
            ..Settings::default()
        }
    }

    /// Performs cycles until a request has been handled.
    async fn next_outcome(worker: &mut FetchWorker) -> FetchOutcome {
        loop {
            if let Some(outcome) = worker.step().await.unwrap() {
                return outcome;
            }
        }
    }

    async fn setup(
        settings: Settings,
        adapter: RecordingAdapter,
    ) -> (WorkerContext, Arc<RecordingAdapter>, FetchWorker) {
        let context = context(settings);
        add_web_service(&context, "ws", "http://localhost/").await;
        add_element_set(&context, "gauges", &["a", "b"]).await;

        let adapter = Arc::new(adapter);
        let worker = FetchWorker::new(
            context.clone(),
            Arc::new(SingleAdapterFactory(adapter.clone())),
        );

        (context, adapter, worker)
    }

    async fn request(
        context: &WorkerContext,
        element_set_id: &str,
        time_stamp: &str,
    ) -> ValueSetRequestEntry {
        let request = ValueSetRequestEntry::new("ws", "flow", element_set_id, time_stamp, "base");
        assert_eq!(
            context
                .store
                .value_set_requests
                .offer(request.clone())
                .await
                .unwrap(),
            true
        );

        request
    }

    #[test]
    fn requested_value_sets_are_fetched_and_cached() {
        test_async(async {
            let (context, adapter, mut worker) =
                setup(settings(), RecordingAdapter::default()).await;
            let request = request(&context, "gauges", "t1").await;

            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            context.shutdown.cancel();
            worker.finish().await.unwrap();

            let entry = context
                .store
                .value_sets
                .get(&request.key())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.values(), &[1., 2.]);
            assert_eq!(entry.needs_upload(), true);
            assert_eq!(
                adapter.calls.lock().unwrap().clone(),
                vec![(
                    "flow".to_owned(),
                    vec!["a".to_owned(), "b".to_owned()],
                    "t1".to_owned()
                )]
            );
            assert_eq!(*adapter.started.lock().unwrap(), 1);
            assert_eq!(*adapter.stopped.lock().unwrap(), 1);
        });
    }

    #[test]
    fn repeated_requests_are_dropped() {
        test_async(async {
            let (context, adapter, mut worker) =
                setup(settings(), RecordingAdapter::default()).await;
            let _ = request(&context, "gauges", "t1").await;
            let _ = request(&context, "gauges", "t1").await;

            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Duplicate);
            worker.finish().await.unwrap();

            assert_eq!(adapter.calls.lock().unwrap().len(), 1);
            assert_eq!(context.metrics.get(DEDUP_DROPS).count(), 1);
        });
    }

    #[test]
    fn requests_older_than_the_history_are_handled_again() {
        test_async(async {
            let (context, adapter, mut worker) = setup(
                Settings {
                    client_count: 1,
                    ..settings()
                },
                RecordingAdapter {
                    fail: true,
                    ..RecordingAdapter::default()
                },
            )
            .await;

            // As every fetch fails, nothing gets cached and only the history decides...
            for time_stamp in ["t1", "t2", "t1"] {
                let _ = request(&context, "gauges", time_stamp).await;
                assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            }
            worker.finish().await.unwrap();

            assert_eq!(adapter.calls.lock().unwrap().len(), 3);
            assert_eq!(context.metrics.get(FETCH_FAILURES).count(), 3);
        });
    }

    #[test]
    fn cached_value_sets_are_not_fetched_again() {
        test_async(async {
            let (context, adapter, mut worker) =
                setup(settings(), RecordingAdapter::default()).await;
            let request = request(&context, "gauges", "t1").await;
            let entry = ValueSetEntry::delivered(request.clone(), vec![5., 6.]);
            context
                .store
                .value_sets
                .put(entry.key(), entry)
                .await
                .unwrap();

            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Cached);
            worker.finish().await.unwrap();
            assert_eq!(adapter.calls.lock().unwrap().len(), 0);
        });
    }

    #[test]
    fn value_sets_are_assembled_from_known_element_sets() {
        test_async(async {
            let (context, adapter, mut worker) = setup(
                Settings {
                    enable_assembly: true,
                    ..settings()
                },
                RecordingAdapter::default(),
            )
            .await;
            add_element_set(&context, "S1", &["a", "b"]).await;
            add_element_set(&context, "S2", &["c"]).await;
            add_element_set(&context, "E", &["a", "b", "c"]).await;

            // Make S1 and S2 known to the worker by requesting them for another time...
            for element_set_id in ["S1", "S2"] {
                let _ = request(&context, element_set_id, "T0").await;
                assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            }

            for (element_set_id, values) in [("S1", vec![1.0, 2.0]), ("S2", vec![3.0])] {
                let entry = ValueSetEntry::new(
                    ValueSetRequestEntry::new("ws", "flow", element_set_id, "T", "base"),
                    values,
                );
                context
                    .store
                    .value_sets
                    .put(entry.key(), entry)
                    .await
                    .unwrap();
            }

            let request = request(&context, "E", "T").await;
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Assembled);
            worker.finish().await.unwrap();

            let assembled = context
                .store
                .value_sets
                .get(&request.key())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(assembled.values(), &[1.0, 2.0, 3.0]);
            assert_eq!(assembled.needs_upload(), true);
            assert_eq!(adapter.calls.lock().unwrap().len(), 2);
            assert_eq!(context.metrics.get(ASSEMBLED_VALUE_SETS).count(), 1);
        });
    }

    #[test]
    fn uncovered_elements_fall_back_to_fetching() {
        test_async(async {
            let (context, adapter, mut worker) = setup(
                Settings {
                    enable_assembly: true,
                    ..settings()
                },
                RecordingAdapter::default(),
            )
            .await;
            add_element_set(&context, "E", &["a", "b", "d"]).await;

            // "gauges" covers a and b, but nothing covers d...
            let _ = request(&context, "gauges", "T").await;
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            let _ = request(&context, "E", "T").await;
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            worker.finish().await.unwrap();

            assert_eq!(adapter.calls.lock().unwrap().len(), 2);
        });
    }

    #[test]
    fn unknown_metadata_only_drops_the_request() {
        test_async(async {
            let (context, adapter, mut worker) =
                setup(settings(), RecordingAdapter::default()).await;

            let _ = request(&context, "unknown", "t1").await;
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Failed);

            let unknown_service =
                ValueSetRequestEntry::new("other", "flow", "gauges", "t1", "base");
            let _ = context
                .store
                .value_set_requests
                .offer(unknown_service)
                .await
                .unwrap();
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Failed);

            // ...the worker still handles the next request...
            let _ = request(&context, "gauges", "t2").await;
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            worker.finish().await.unwrap();

            assert_eq!(adapter.calls.lock().unwrap().len(), 1);
            assert_eq!(context.metrics.get(FETCH_FAILURES).count(), 2);
        });
    }

    #[test]
    fn stopping_leaves_queued_requests_behind() {
        test_async(async {
            let (context, adapter, mut worker) =
                setup(settings(), RecordingAdapter::default()).await;
            let _ = request(&context, "gauges", "t1").await;
            let _ = request(&context, "gauges", "t2").await;

            context.shutdown.cancel();
            worker.run().await.unwrap();
            worker.finish().await.unwrap();

            assert_eq!(
                context.store.value_set_requests.len().await.unwrap(),
                2
            );
            assert_eq!(adapter.calls.lock().unwrap().len(), 0);
        });
    }

    #[test]
    fn nothing_is_taken_while_all_slots_are_busy() {
        test_async(async {
            let (context, adapter, mut worker) = setup(
                Settings {
                    client_count: 1,
                    ..settings()
                },
                RecordingAdapter::default(),
            )
            .await;
            let _ = request(&context, "gauges", "t1").await;

            let busy = worker.pool.reserve().await.unwrap();
            assert_eq!(worker.step().await.unwrap(), None);
            assert_eq!(worker.step().await.unwrap(), None);
            assert_eq!(context.store.value_set_requests.len().await.unwrap(), 1);

            // Once the slot is released, the request is handled...
            std::mem::drop(busy);
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            assert_eq!(context.store.value_set_requests.len().await.unwrap(), 0);
            worker.finish().await.unwrap();

            assert_eq!(adapter.calls.lock().unwrap().len(), 1);
        });
    }

    #[test]
    fn nothing_is_taken_while_the_cache_is_full() {
        test_async(async {
            let (context, adapter, mut worker) = setup(
                Settings {
                    max_memory: 0,
                    ..settings()
                },
                RecordingAdapter::default(),
            )
            .await;
            let cached = ValueSetEntry::new(
                ValueSetRequestEntry::new("ws", "flow", "gauges", "t0", "base"),
                vec![1., 2.],
            );
            context
                .store
                .value_sets
                .put(cached.key(), cached.clone())
                .await
                .unwrap();
            let _ = request(&context, "gauges", "t1").await;

            assert_eq!(worker.step().await.unwrap(), None);
            assert_eq!(context.store.value_set_requests.len().await.unwrap(), 1);
            assert_eq!(context.metrics.get(ADMISSION_WAITS).count(), 1);

            // Freeing the cache admits the request again...
            let _ = context.store.value_sets.remove(&cached.key()).await.unwrap();
            assert_eq!(next_outcome(&mut worker).await, FetchOutcome::Dispatched);
            worker.finish().await.unwrap();

            assert_eq!(adapter.calls.lock().unwrap().len(), 1);
        });
    }
}
