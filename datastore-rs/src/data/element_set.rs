use crate::store::{ByteSize, UploadState};

/// Describes an ordered list of elements (e.g. measurement sites).
///
/// The position of an element id is the index of its reading in every
/// [ValueSetEntry](crate::data::ValueSetEntry) which refers to this element set.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementSetEntry {
    element_set_id: String,
    element_ids: Vec<String>,
}

impl ElementSetEntry {
    /// Creates a new element set.
    pub fn new(element_set_id: impl Into<String>, element_ids: Vec<String>) -> Self {
        ElementSetEntry {
            element_set_id: element_set_id.into(),
            element_ids,
        }
    }

    /// Returns the id of this element set.
    pub fn element_set_id(&self) -> &str {
        &self.element_set_id
    }

    /// Returns the element ids in their significant order.
    pub fn element_ids(&self) -> &[String] {
        &self.element_ids
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.element_ids.len()
    }

    /// Determines if this set contains no elements at all.
    pub fn is_empty(&self) -> bool {
        self.element_ids.is_empty()
    }
}

impl UploadState for ElementSetEntry {}

impl ByteSize for ElementSetEntry {
    fn allocated_size(&self) -> usize {
        self.element_set_id.capacity()
            + self
                .element_ids
                .iter()
                .map(|id| id.capacity())
                .sum::<usize>()
    }
}
