use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;

use crate::adapter::xml::{read_values, write_get_values, write_set_values};
use crate::adapter::{CollectorAdapter, FetchAdapter};
use crate::data::{ElementSetEntry, ValueSetEntry};

type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

fn new_client() -> HttpClient {
    Client::builder().build::<_, Body>(HttpsConnector::new())
}

async fn post(
    client: &HttpClient,
    url: &str,
    action: &str,
    body: Vec<u8>,
) -> anyhow::Result<Bytes> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(url)
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", format!("http://tempuri.org/{}", action))
        .body(Body::from(body))
        .context("Failed to build request.")?;

    let response = client
        .request(request)
        .await
        .with_context(|| format!("Failed to invoke {} on {}.", action, url))?;

    if response.status() != StatusCode::OK {
        return Err(anyhow::anyhow!(
            "{} on {} failed with HTTP status {}.",
            action,
            url,
            response.status()
        ));
    }

    hyper::body::to_bytes(response.into_body())
        .await
        .with_context(|| format!("Failed to read the response of {} from {}.", action, url))
}

/// Fetches values from a web service which speaks the **SimpleRest** protocol.
///
/// A **GetValues** request is posted to the url of the web service. The response is expected to
/// contain a **value** element per requested element, in the same order.
pub struct SimpleRestAdapter {
    url: String,
    client: HttpClient,
}

impl SimpleRestAdapter {
    /// Creates an adapter which talks to the given url.
    pub fn new(url: impl Into<String>) -> Self {
        SimpleRestAdapter {
            url: url.into(),
            client: new_client(),
        }
    }
}

#[async_trait]
impl FetchAdapter for SimpleRestAdapter {
    async fn start(&self) -> anyhow::Result<()> {
        log::debug!("Using SimpleRest service at {}", self.url);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        log::debug!("Released SimpleRest service at {}", self.url);
        Ok(())
    }

    async fn get_values(
        &self,
        quantity_id: &str,
        element_ids: &[String],
        time_stamp: &str,
    ) -> anyhow::Result<Vec<f64>> {
        let body = write_get_values(quantity_id, element_ids, time_stamp)?;
        let response = post(&self.client, &self.url, "GetValues", body).await?;

        read_values(&response).with_context(|| format!("Invalid response from {}.", self.url))
    }
}

/// Delivers value sets to a collector which speaks the **SimpleRest** protocol.
///
/// All entries of a batch are posted as a single **SetValues** request.
pub struct SimpleRestCollector {
    client: HttpClient,
}

impl Default for SimpleRestCollector {
    fn default() -> Self {
        SimpleRestCollector {
            client: new_client(),
        }
    }
}

impl SimpleRestCollector {
    /// Creates a new collector adapter.
    pub fn new() -> Self {
        SimpleRestCollector::default()
    }
}

#[async_trait]
impl CollectorAdapter for SimpleRestCollector {
    async fn set_values(
        &self,
        element_sets: &HashMap<String, Arc<ElementSetEntry>>,
        url: &str,
        entries: &[ValueSetEntry],
    ) -> anyhow::Result<()> {
        let body = write_set_values(element_sets, entries)?;
        let _ = post(&self.client, url, "SetValues", body).await?;

        Ok(())
    }
}
