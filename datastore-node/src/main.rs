use std::sync::Arc;

use datastore::adapter::{ServiceAdapters, SimpleRestCollector};
use datastore::builder::Builder;
use datastore::metrics::Metrics;
use datastore::settings::SettingsHandle;

#[tokio::main]
async fn main() {
    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;

    // Terminating the platform clears all services, therefore we keep these around...
    let metrics = platform.require::<Metrics>();
    let settings = platform.require::<SettingsHandle>();

    // Start the four workers...
    let workers = datastore::workers::install(
        platform.clone(),
        Arc::new(ServiceAdapters::default()),
        Arc::new(SimpleRestCollector::new()),
    );

    // Wait for a termination signal and for the delivery worker to drain its buffer...
    workers.join().await;

    let settings = settings.current();
    match metrics.write_csv(settings.node_id, &settings.metrics_csv_file) {
        Ok(()) => log::info!("Wrote the statistics to {}.", settings.metrics_csv_file),
        Err(error) => log::error!(
            "Failed to write the statistics to {}: {:#}",
            settings.metrics_csv_file,
            error
        ),
    }
}
