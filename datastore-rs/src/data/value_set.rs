use std::fmt::{Display, Formatter};

use crate::data::create_key;
use crate::store::{ByteSize, UploadState};

/// Identifies a value set which is to be obtained.
///
/// Producers push these into the request queue. The fetch worker either assembles the value set
/// from other cached value sets or invokes the appropriate web service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueSetRequestEntry {
    /// The id of the web service which provides the data.
    pub web_service_id: String,
    /// The quantity (variable) being observed.
    pub quantity_id: String,
    /// The element set whose elements determine the layout of the values.
    pub element_set_id: String,
    /// An opaque timestamp token which is passed to the web service as is.
    pub time_stamp: String,
    /// The scenario this value set belongs to.
    pub scenario_id: String,
}

impl ValueSetRequestEntry {
    /// Creates a new request for the given identity.
    pub fn new(
        web_service_id: impl Into<String>,
        quantity_id: impl Into<String>,
        element_set_id: impl Into<String>,
        time_stamp: impl Into<String>,
        scenario_id: impl Into<String>,
    ) -> Self {
        ValueSetRequestEntry {
            web_service_id: web_service_id.into(),
            quantity_id: quantity_id.into(),
            element_set_id: element_set_id.into(),
            time_stamp: time_stamp.into(),
            scenario_id: scenario_id.into(),
        }
    }

    /// Returns the key under which the requested value set is stored in the cache map.
    pub fn key(&self) -> String {
        create_key(
            &self.web_service_id,
            &self.quantity_id,
            &self.element_set_id,
            &self.time_stamp,
            &self.scenario_id,
        )
    }

    /// Returns the same identity but for another element set.
    ///
    /// This is used by the assembly to determine the keys of value sets which might provide
    /// some of the requested values.
    pub fn for_element_set(&self, element_set_id: &str) -> ValueSetRequestEntry {
        ValueSetRequestEntry {
            element_set_id: element_set_id.to_owned(),
            ..self.clone()
        }
    }
}

impl Display for ValueSetRequestEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.web_service_id,
            self.quantity_id,
            self.element_set_id,
            self.time_stamp,
            self.scenario_id
        )
    }
}

/// A cached vector of readings.
///
/// The number of values always matches the number of elements in the element set named by the
/// identity, as the value at index **i** belongs to the element at index **i**.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueSetEntry {
    id: ValueSetRequestEntry,
    needs_upload: bool,
    values: Vec<f64>,
}

impl ValueSetEntry {
    /// Creates a freshly produced value set which still has to be handed to the collector.
    pub fn new(id: ValueSetRequestEntry, values: Vec<f64>) -> Self {
        ValueSetEntry {
            id,
            needs_upload: true,
            values,
        }
    }

    /// Creates a value set which is not subject to delivery (e.g. one that was received from
    /// the collector side and only needs to be cached).
    pub fn delivered(id: ValueSetRequestEntry, values: Vec<f64>) -> Self {
        ValueSetEntry {
            id,
            needs_upload: false,
            values,
        }
    }

    /// Returns the identity of this value set.
    pub fn id(&self) -> &ValueSetRequestEntry {
        &self.id
    }

    /// Returns the key under which this entry is stored.
    pub fn key(&self) -> String {
        self.id.key()
    }

    /// Returns the id of the element set which defines the layout of the values.
    pub fn element_set_id(&self) -> &str {
        &self.id.element_set_id
    }

    /// Returns the timestamp token of this value set.
    pub fn time_stamp(&self) -> &str {
        &self.id.time_stamp
    }

    /// Determines if this entry still has to be delivered to the collector.
    pub fn needs_upload(&self) -> bool {
        self.needs_upload
    }

    /// Returns a copy of this entry which has been claimed for delivery.
    pub fn claimed(&self) -> ValueSetEntry {
        ValueSetEntry {
            needs_upload: false,
            ..self.clone()
        }
    }

    /// Returns the readings in the order of the elements of the element set.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

impl UploadState for ValueSetEntry {
    fn needs_upload(&self) -> bool {
        self.needs_upload
    }
}

impl ByteSize for ValueSetEntry {
    fn allocated_size(&self) -> usize {
        self.id.web_service_id.capacity()
            + self.id.quantity_id.capacity()
            + self.id.element_set_id.capacity()
            + self.id.time_stamp.capacity()
            + self.id.scenario_id.capacity()
            + self.values.capacity() * std::mem::size_of::<f64>()
    }
}

impl Display for ValueSetEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.id,
            self.values.len(),
            self.needs_upload
        )
    }
}
