//! Loads the [Settings] of a node from **config/settings.yml** and reloads them on change.
//!
//! A [Config] only ever holds validated settings. Every load parses the whole file into
//! [Settings] first. If this fails (a YAML syntax error, a malformed size or duration, a zero
//! client count...) the error is reported and the previously loaded settings remain active.
//! Otherwise the new settings replace the old ones and are announced to every subscriber (see
//! [Config::subscribe]).
//!
//! [install] checks the modification time of the file every two seconds and reloads it once it
//! changed. A missing file is not an error, the node simply runs with the defaults.
//!
//! # Examples
//!
//! ```
//! # use datastore::config::Config;
//! let config = Config::new("settings.yml");
//! let mut changes = config.subscribe();
//!
//! config.apply("workers:\n    client_count: 4").unwrap();
//! assert_eq!(config.settings().client_count, 4);
//! assert_eq!(changes.try_recv().unwrap().client_count, 4);
//!
//! // An invalid value is rejected as a whole...
//! assert_eq!(config.apply("workers:\n    client_count: 0").is_err(), true);
//! assert_eq!(config.settings().client_count, 4);
//! ```
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::broadcast;

use crate::platform::Platform;
use crate::settings::Settings;

/// The file which is loaded by [install].
pub const CONFIG_FILE: &str = "config/settings.yml";

const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

struct Loaded {
    settings: Arc<Settings>,
    modified: Option<SystemTime>,
}

/// Holds the settings loaded from a config file.
pub struct Config {
    path: PathBuf,
    current: ArcSwap<Loaded>,
    tx: broadcast::Sender<Arc<Settings>>,
}

impl Config {
    /// Creates a config for the given file which serves the default settings until the file
    /// is loaded.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(1);
        Config {
            path: path.into(),
            current: ArcSwap::new(Arc::new(Loaded {
                settings: Arc::new(Settings::default()),
                modified: None,
            })),
            tx,
        }
    }

    /// Returns the path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the currently active settings.
    pub fn settings(&self) -> Arc<Settings> {
        self.current.load().settings.clone()
    }

    /// Returns a receiver which is handed the new settings whenever they change.
    ///
    /// Note that a slow receiver might miss intermediate changes, in which case it should
    /// fall back to [Config::settings].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Parses and validates the given YAML data and makes it the active settings.
    ///
    /// Returns the new settings or an error if the data is invalid, in which case the
    /// previous settings remain active.
    pub fn apply(&self, data: &str) -> anyhow::Result<Arc<Settings>> {
        let modified = self.current.load().modified;
        self.apply_loaded(data, modified)
    }

    fn apply_loaded(
        &self,
        data: &str,
        modified: Option<SystemTime>,
    ) -> anyhow::Result<Arc<Settings>> {
        let previous = self.settings();
        let settings = match Settings::parse(data) {
            Ok(settings) => Arc::new(settings),
            Err(error) => {
                // Remember the attempt so that an unchanged broken file isn't reported again...
                self.current.store(Arc::new(Loaded {
                    settings: previous,
                    modified,
                }));
                return Err(error);
            }
        };

        self.current.store(Arc::new(Loaded {
            settings: settings.clone(),
            modified,
        }));

        if *previous != *settings {
            log::info!("Settings have been updated.");
            let _ = self.tx.send(settings.clone());
        }

        Ok(settings)
    }

    /// Loads the underlying file if it has been modified since the last attempt.
    ///
    /// Returns **true** if the file was loaded, **false** if it is missing or unchanged, or an
    /// error if it could not be read or contains invalid settings.
    pub async fn reload(&self) -> anyhow::Result<bool> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("Cannot access {}", self.path.display()))
            }
        };

        let modified = metadata.modified().ok();
        if modified.is_some() && modified == self.current.load().modified {
            return Ok(false);
        }

        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Cannot read {}", self.path.display()))?;
        let _ = self
            .apply_loaded(&data, modified)
            .with_context(|| format!("Invalid settings in {}", self.path.display()))?;

        Ok(true)
    }
}

/// Loads [CONFIG_FILE] into a new [Config] and registers it in the platform.
///
/// The file is checked for changes every two seconds until the platform shuts down.
pub async fn install(platform: Arc<Platform>) -> Arc<Config> {
    if let Err(error) = tokio::fs::create_dir_all("config").await {
        log::warn!("Cannot create the config directory: {}", error);
    }

    let config = Arc::new(Config::new(CONFIG_FILE));
    platform.register::<Config>(config.clone());

    match config.reload().await {
        Ok(true) => log::info!("Loaded settings from {}.", CONFIG_FILE),
        Ok(false) => log::info!("{} is not present. Using the defaults.", CONFIG_FILE),
        Err(error) => log::error!("{:#}. Using the defaults.", error),
    }

    let monitor = config.clone();
    let shutdown = platform.shutdown_token();
    let _ = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {
                    if let Err(error) = monitor.reload().await {
                        log::error!("{:#}. Keeping the previous settings.", error);
                    }
                }
            }
        }
    });

    config
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::testing::test_async;

    #[test]
    fn valid_changes_are_applied_and_announced() {
        let config = Config::new("unused.yml");
        let mut changes = config.subscribe();

        let settings = config.apply("workers:\n    client_count: 8").unwrap();
        assert_eq!(settings.client_count, 8);
        assert_eq!(config.settings().client_count, 8);
        assert_eq!(changes.try_recv().unwrap().client_count, 8);

        // Applying the same settings again isn't announced...
        let _ = config.apply("workers:\n    client_count: 8").unwrap();
        assert_eq!(changes.try_recv().is_err(), true);
    }

    #[test]
    fn invalid_changes_keep_the_previous_settings() {
        let config = Config::new("unused.yml");
        let _ = config.apply("workers:\n    client_count: 8").unwrap();
        let mut changes = config.subscribe();

        for broken in [
            "store:\n    max_memory: lots",
            "workers:\n    client_count: 0",
            "- a\n- list",
            "workers: [",
        ] {
            assert_eq!(config.apply(broken).is_err(), true);
            assert_eq!(config.settings().client_count, 8);
        }
        assert_eq!(changes.try_recv().is_err(), true);
    }

    #[test]
    fn the_file_is_only_loaded_once_it_changed() {
        test_async(async {
            let path = std::env::temp_dir().join(format!(
                "datastore-settings-{}.yml",
                std::process::id()
            ));
            let config = Config::new(path.clone());
            assert_eq!(config.reload().await.unwrap(), false);

            tokio::fs::write(&path, "eviction:\n    threshold: 75%")
                .await
                .unwrap();
            assert_eq!(config.reload().await.unwrap(), true);
            assert_eq!(config.settings().eviction_threshold, 0.75);
            assert_eq!(config.reload().await.unwrap(), false);

            tokio::fs::remove_file(&path).await.unwrap();
            assert_eq!(config.reload().await.unwrap(), false);
            assert_eq!(config.settings().eviction_threshold, 0.75);
        });
    }
}
