//! Provides a builder which can be used to setup and initialize a node.
//!
//! This can be used to create and setup central parts of a node. As some parts are optional
//! (e.g. tests usually neither want signal handlers nor a config file being monitored), a
//! builder permits to selectively enable or disable them.
//!
//! Note that the workers are not installed by the builder, as they require an
//! [AdapterFactory](crate::adapter::AdapterFactory) and a
//! [CollectorAdapter](crate::adapter::CollectorAdapter). Use
//! [workers::install](crate::workers::install) once the platform has been built.
//!
//! # Example
//! Setting up a node with all features enabled:
//! ```no_run
//! # use std::sync::Arc;
//! # use datastore::builder::Builder;
//! # use datastore::adapter::{ServiceAdapters, SimpleRestCollector};
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Start the workers...
//!     let workers = datastore::workers::install(
//!         platform.clone(),
//!         Arc::new(ServiceAdapters::default()),
//!         Arc::new(SimpleRestCollector::new()),
//!     );
//!
//!     // Wait until a signal terminated the platform and all workers drained their buffers...
//!     workers.join().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, DATASTORE_REVISION, DATASTORE_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As some components are optional, a builder permits to selectively enable or disable them.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_settings: bool,
    setup_metrics: bool,
    setup_store: bool,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_settings: false,
            setup_metrics: false,
            setup_store: false,
        }
    }

    /// Enables all features.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_settings = true;
        self.setup_metrics = true;
        self.setup_store = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend to
    /// run a node in a docker container, this is all that is needed for proper logging.
    /// Note that this is the only supported setup, as we use custom formats and line endings.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the platform once **CTRL+C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Loads and installs the config file **config/settings.yml** which is monitored for changes.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables loading and installing the config.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Parses the [Settings](crate::settings::Settings) of the node from the config and keeps
    /// them up to date.
    ///
    /// If no config is installed, the defaults are used.
    pub fn enable_settings(mut self) -> Self {
        self.setup_settings = true;
        self
    }

    /// Disables installing the settings.
    pub fn disable_settings(mut self) -> Self {
        self.setup_settings = false;
        self
    }

    /// Installs the [Metrics](crate::metrics::Metrics) registry along with its periodic reporter.
    pub fn enable_metrics(mut self) -> Self {
        self.setup_metrics = true;
        self
    }

    /// Disables installing the metrics registry.
    pub fn disable_metrics(mut self) -> Self {
        self.setup_metrics = false;
        self
    }

    /// Installs a [SharedStore](crate::store::SharedStore) which keeps all maps and queues
    /// in the memory of this process.
    pub fn enable_store(mut self) -> Self {
        self.setup_store = true;
        self
    }

    /// Disables installing the local store (e.g. as another backend will be registered).
    pub fn disable_store(mut self) -> Self {
        self.setup_store = false;
        self
    }

    /// Builds the platform and initializes all enabled components.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. DATASTORE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            DATASTORE_VERSION,
            DATASTORE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            let _ = crate::config::install(platform.clone()).await;
        }

        if self.setup_settings {
            let _ = crate::settings::install(platform.clone());
        }

        if self.setup_metrics {
            let _ = crate::metrics::install(platform.clone());
        }

        if self.setup_store {
            let _ = crate::store::install(platform.clone());
        }

        platform
    }
}
