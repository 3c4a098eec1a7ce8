//! Datastore is a caching node for time series value sets which are fetched from and delivered
//! to hydrological web services.
//!
//! # Introduction
//! A **value set** is a vector of measured values (one per element / location of an
//! **element set**) for a given web service, quantity, time stamp and scenario. Value sets are
//! kept in a map which is shared across all nodes of a cluster. Each node runs four cooperating
//! workers which manage the lifecycle of the value sets owned by this node:
//!
//! * The **ingest worker** moves value sets which have been pushed by producers from the raw value
//!   set queue into the cache.
//! * The **fetch worker** turns requests into cached value sets. Recently handled requests are
//!   dropped, and if enabled, a value set is assembled from cached value sets of other element
//!   sets. Otherwise the value set is fetched from its web service.
//! * The **eviction worker** keeps the cache below its memory limit by removing the oldest
//!   entries which have already been delivered and read.
//! * The **delivery worker** claims all value sets which still need to be uploaded and hands them
//!   to the collector service in size-efficient batches.
//!
//! All workers are throttled: the ingest and fetch worker pause while the cache is over its
//! memory limit, and all calls to web services run in bounded pools.
//!
//! # Modules
//! * [data]: the value set, element set and web service entries along with the key scheme.
//! * [store]: the interfaces of the shared maps and queues plus an in-process implementation.
//! * [workers]: the four workers and their supervisor.
//! * [adapter]: the protocols used to talk to web services (see
//!   [SimpleRestAdapter](adapter::SimpleRestAdapter)).
//! * [settings]: a typed view of the config which is updated whenever the config file changes.
//! * [metrics]: statistics about everything the workers do, reported periodically and written as
//!   CSV on shutdown.
//!
//! # Examples
//! A short example on how to set up a node can be found here: [Builder](builder::Builder). A
//! complete node is provided by the **datastore-node** binary.
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod adapter;
pub mod builder;
pub mod config;
pub mod data;
pub mod fmt;
pub mod metadata;
pub mod metrics;
pub mod platform;
pub mod settings;
pub mod signals;
pub mod store;
pub mod workers;

/// Contains the version of the Datastore library.
pub const DATASTORE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Datastore build being used.
pub const DATASTORE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests may build several platforms, but a logger can only be installed once...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}
