//! Provides a tiny DI like container to expose all components of a node.
//!
//! The platform is more or less a simple map which keeps all central components as
//! **Arc<T>** around. Also this keeps the central shutdown token which is cancelled once
//! [Platform::terminate](Platform::terminate) is invoked.
//!
//! Workers obtain their dependencies during startup using [Platform::require] and keep their own
//! **Arc** around. This is important, as the internal map is cleared once the shutdown is
//! initiated (so that all Dropped handlers run) while a worker might still need to drain its
//! buffers. Code which might run after [Platform::terminate](Platform::terminate) should
//! therefore use [Platform::find](Platform::find) and gracefully handle the **None** case.
//!
//! Long running loops either check [Platform::is_running] between two iterations or wait for
//! [Platform::shutdown_token] within a **tokio::select!** so that a blocking wait (e.g. polling
//! a queue for 60s) is interrupted immediately.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use datastore::platform::Platform;
//! struct Service {
//!     value : i32
//! }
//!
//! struct UnknownService;
//!
//! let platform = Platform::new();
//!
//! // Registers a new service...
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//!
//! // Obtains a reference to a previously registered service...
//! let service = platform.require::<Service>();
//! assert_eq!(service.value, 42);
//!
//! // Trying to obtain a service which hasn't been registered yet, returns an empty
//! // optional...
//! assert_eq!(platform.find::<UnknownService>().is_none(), true);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated...
//! platform.terminate();
//! // All services are immediately released so that their "Dropped" handlers run...
//! assert_eq!(platform.find::<Service>().is_none(), true);
//!
//! // and the platform is no longer considered active...
//! assert_eq!(platform.is_running(), false);
//! assert_eq!(platform.shutdown_token().is_cancelled(), true);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Provides a container to keep all central services in a single place.
///
/// # Examples
///
/// Building a simple platform:
/// ```
/// # use datastore::builder::Builder;
/// # #[tokio::main]
/// # async fn main() {
/// let platform = Builder::new().enable_all().disable_signals().build().await;
/// # }
/// ```
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    shutdown: CancellationToken,
}

impl Platform {
    /// Creates a new and empty platform.
    ///
    /// Note that most probably a [Builder](crate::builder::Builder) should be used to construct
    /// the platform.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers a new component.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .services
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered service.
    ///
    /// Note, if one knows for certain, that a service is present,
    /// [Platform::require](Platform::require) can be used.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let services = self.services.lock().unwrap();
        services
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Returns a service which is known to be present.
    ///
    /// # Panics
    /// Panics if the requested service isn't available or if the platform is already shutting
    /// down.
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(service) => service,
                None => panic!(
                    "A required component ({}) was not available in the platform registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Returns a token which is cancelled once the platform terminates.
    ///
    /// The returned token is a child of the central one, so that it can be safely moved into
    /// a worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all services (so that their **Dropped** handlers run
    /// eventually). It will also signal all workers to stop and to drain what they hold.
    pub fn terminate(&self) {
        // Drop all services so that the Dropped handlers run (sooner or later)...
        self.services.lock().unwrap().clear();

        // Wake up everyone who waits for the shutdown...
        self.shutdown.cancel();
    }
}
