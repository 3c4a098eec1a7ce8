use std::fmt::{Display, Formatter};

use crate::store::{ByteSize, UploadState};

/// Describes an external web service which either provides or collects value sets.
#[derive(Clone, Debug, PartialEq)]
pub struct WebServiceEntry {
    /// The id which is referenced by value sets and requests.
    pub id: String,
    /// The protocol type which determines the adapter to use (e.g. **SimpleRest**).
    pub service_type: String,
    /// A human readable description.
    pub description: String,
    /// The base url of the service.
    pub url: String,
    /// The typical service time as reported by the operator, if known.
    pub service_time_ms: Option<u64>,
    /// The maximal number of parallel requests permitted by the operator, if known.
    pub max_requests: Option<usize>,
    /// The quantities offered by this service.
    pub quantities: Vec<String>,
}

impl WebServiceEntry {
    /// Creates a descriptor with the given id, type and url and no further metadata.
    pub fn new(
        id: impl Into<String>,
        service_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        WebServiceEntry {
            id: id.into(),
            service_type: service_type.into(),
            description: String::new(),
            url: url.into(),
            service_time_ms: None,
            max_requests: None,
            quantities: Vec::new(),
        }
    }
}

impl Display for WebServiceEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.id,
            self.service_type,
            self.url,
            self.quantities.join(",")
        )
    }
}

impl UploadState for WebServiceEntry {}

impl ByteSize for WebServiceEntry {
    fn allocated_size(&self) -> usize {
        self.id.capacity()
            + self.service_type.capacity()
            + self.description.capacity()
            + self.url.capacity()
            + self
                .quantities
                .iter()
                .map(|quantity| quantity.capacity())
                .sum::<usize>()
    }
}
