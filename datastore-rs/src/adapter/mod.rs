//! Connects a node to external web services.
//!
//! A [FetchAdapter] obtains the values of a value set from a data provider. Adapters are created
//! per web service by an [AdapterFactory], which selects the implementation based on the
//! **service_type** of the [WebServiceEntry]. The fetch worker creates and starts an adapter when
//! a web service is used for the first time and stops all of them when shutting down.
//!
//! A [CollectorAdapter] hands delivered value sets to the collector service.
//!
//! The only protocol shipped with this crate is **SimpleRest** (see [SimpleRestAdapter] and
//! [SimpleRestCollector]) which posts small XML documents via HTTP(S).
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::data::{ElementSetEntry, ValueSetEntry, WebServiceEntry};

mod simple_rest;
mod xml;

pub use simple_rest::{SimpleRestAdapter, SimpleRestCollector};

/// The service type of web services which speak the **SimpleRest** protocol.
pub const SIMPLE_REST: &str = "SimpleRest";

/// Obtains value sets from an external data provider.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    /// Prepares the adapter before its first use.
    async fn start(&self) -> anyhow::Result<()>;

    /// Releases all resources held by the adapter.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Fetches the values of the given quantity at the given time for the given elements.
    ///
    /// The returned values are expected to be in the order of the given element ids.
    async fn get_values(
        &self,
        quantity_id: &str,
        element_ids: &[String],
        time_stamp: &str,
    ) -> anyhow::Result<Vec<f64>>;
}

/// Hands value sets to an external collector service.
#[async_trait]
pub trait CollectorAdapter: Send + Sync {
    /// Delivers the given entries to the collector at the given url.
    ///
    /// **element_sets** maps the id of each element set referenced by the entries to its
    /// descriptor, so that each value can be labeled with its element.
    async fn set_values(
        &self,
        element_sets: &HashMap<String, Arc<ElementSetEntry>>,
        url: &str,
        entries: &[ValueSetEntry],
    ) -> anyhow::Result<()>;
}

/// Creates the fetch adapter for a web service.
pub trait AdapterFactory: Send + Sync {
    /// Creates an adapter which talks to the given web service.
    ///
    /// Fails if the service type isn't supported.
    fn create(&self, web_service: &WebServiceEntry) -> anyhow::Result<Arc<dyn FetchAdapter>>;
}

/// Provides the adapters for all protocols supported by this crate.
#[derive(Default)]
pub struct ServiceAdapters;

impl AdapterFactory for ServiceAdapters {
    fn create(&self, web_service: &WebServiceEntry) -> anyhow::Result<Arc<dyn FetchAdapter>> {
        match web_service.service_type.as_str() {
            SIMPLE_REST => Ok(Arc::new(SimpleRestAdapter::new(web_service.url.as_str()))),
            other => Err(anyhow::anyhow!(
                "Web service {} has an unsupported type: {}",
                web_service.id,
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::{AdapterFactory, ServiceAdapters, SIMPLE_REST};
    use crate::data::WebServiceEntry;

    #[test]
    fn only_known_service_types_are_supported() {
        let factory = ServiceAdapters::default();

        assert_eq!(
            factory
                .create(&WebServiceEntry::new("ws", SIMPLE_REST, "http://localhost/"))
                .is_ok(),
            true
        );
        assert_eq!(
            factory
                .create(&WebServiceEntry::new(
                    "ws",
                    "WaterOneFlow1.1",
                    "http://localhost/"
                ))
                .is_err(),
            true
        );
    }
}
