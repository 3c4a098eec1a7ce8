//! Derives requested value sets from already cached ones.
//!
//! Element sets often overlap (e.g. a region and its sub regions). If all elements of a
//! requested element set are covered by other element sets whose value sets for the same
//! quantity, time and scenario are already cached, the requested value set can be copied together
//! without calling the web service at all.
//!
//! Assembling happens in two steps. [plan] determines which element set provides which element,
//! based on the element sets known to the worker. [assemble] then reads the required value sets
//! from the cache. If any element has no source or any source value set is missing, no value set
//! is produced and the worker falls back to fetching it.
use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::data::{ElementSetEntry, ValueSetEntry, ValueSetRequestEntry};
use crate::store::SharedMap;

/// Describes where the value of a single element is taken from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    /// The element set which contains the element.
    pub element_set_id: String,
    /// The position of the element in that element set.
    pub index: usize,
}

/// Determines a source for each element of the given target element set.
///
/// The candidates are scanned in the given order and the first element set which contains an
/// element is used for it. The target element set itself is never used as source.
///
/// Returns **None** if at least one element isn't contained in any candidate.
pub fn plan<'a>(
    target: &ElementSetEntry,
    candidates: impl IntoIterator<Item = &'a ElementSetEntry>,
) -> Option<Vec<Source>> {
    let mut sources: Vec<Option<Source>> = vec![None; target.len()];
    let mut pending: HashMap<&str, Vec<usize>> = HashMap::new();
    for (position, element_id) in target.element_ids().iter().enumerate() {
        pending
            .entry(element_id.as_str())
            .or_default()
            .push(position);
    }

    for candidate in candidates {
        if pending.is_empty() {
            break;
        }
        if candidate.element_set_id() == target.element_set_id() {
            continue;
        }

        for (index, element_id) in candidate.element_ids().iter().enumerate() {
            if let Some(positions) = pending.remove(element_id.as_str()) {
                for position in positions {
                    sources[position] = Some(Source {
                        element_set_id: candidate.element_set_id().to_owned(),
                        index,
                    });
                }
            }
        }
    }

    if !pending.is_empty() {
        return None;
    }

    sources.into_iter().collect()
}

/// Copies the values of the cached source value sets into a vector aligned with the requested
/// element set.
///
/// Returns **None** if a source value set isn't cached or doesn't contain the expected index.
pub async fn assemble(
    request: &ValueSetRequestEntry,
    sources: &[Source],
    value_sets: &dyn SharedMap<ValueSetEntry>,
) -> anyhow::Result<Option<Vec<f64>>> {
    let element_set_ids: Vec<&str> = sources
        .iter()
        .map(|source| source.element_set_id.as_str())
        .unique()
        .collect();

    let mut source_value_sets: HashMap<&str, ValueSetEntry> = HashMap::new();
    for element_set_id in element_set_ids {
        let key = request.for_element_set(element_set_id).key();
        match value_sets.get(&key).await? {
            Some(value_set) => {
                let _ = source_value_sets.insert(element_set_id, value_set);
            }
            None => return Ok(None),
        }
    }

    Ok(sources
        .iter()
        .map(|source| {
            source_value_sets
                .get(source.element_set_id.as_str())
                .and_then(|value_set| value_set.values().get(source.index))
                .copied()
        })
        .collect())
}

/// Tries to assemble the requested value set from the known element sets and the cache.
pub async fn try_assemble(
    request: &ValueSetRequestEntry,
    target: &ElementSetEntry,
    known_element_sets: &[Arc<ElementSetEntry>],
    value_sets: &dyn SharedMap<ValueSetEntry>,
) -> anyhow::Result<Option<ValueSetEntry>> {
    if target.is_empty() {
        return Ok(None);
    }

    let sources = match plan(target, known_element_sets.iter().map(Arc::as_ref)) {
        Some(sources) => sources,
        None => return Ok(None),
    };

    Ok(assemble(request, &sources, value_sets)
        .await?
        .map(|values| ValueSetEntry::new(request.clone(), values)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::data::{ElementSetEntry, ValueSetEntry, ValueSetRequestEntry};
    use crate::store::{LocalMap, SharedMap};
    use crate::testing::test_async;
    use crate::workers::assembly::{plan, try_assemble, Source};

    fn element_set(id: &str, elements: &[&str]) -> ElementSetEntry {
        ElementSetEntry::new(id, elements.iter().map(|e| e.to_string()).collect())
    }

    #[test]
    fn the_first_candidate_containing_an_element_wins() {
        let target = element_set("e", &["a", "b", "c"]);
        let first = element_set("s1", &["x", "b", "a"]);
        let second = element_set("s2", &["a", "c"]);

        assert_eq!(
            plan(&target, [&target, &first, &second]).unwrap(),
            vec![
                Source {
                    element_set_id: "s1".to_owned(),
                    index: 2
                },
                Source {
                    element_set_id: "s1".to_owned(),
                    index: 1
                },
                Source {
                    element_set_id: "s2".to_owned(),
                    index: 1
                },
            ]
        );

        // The target itself never counts as source...
        assert_eq!(plan(&target, [&target, &first]), None);
    }

    #[test]
    fn values_are_copied_from_all_sources() {
        test_async(async {
            let value_sets = LocalMap::new();
            let target = element_set("E", &["a", "b", "c"]);
            let s1 = Arc::new(element_set("S1", &["a", "b"]));
            let s2 = Arc::new(element_set("S2", &["c"]));

            let request = ValueSetRequestEntry::new("ws", "flow", "E", "T", "base");
            for (source, values) in [("S1", vec![1.0, 2.0]), ("S2", vec![3.0])] {
                let entry = ValueSetEntry::new(request.for_element_set(source), values);
                value_sets.put(entry.key(), entry).await.unwrap();
            }

            let assembled = try_assemble(&request, &target, &[s1.clone(), s2], &value_sets)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(assembled.values(), &[1.0, 2.0, 3.0]);
            assert_eq!(assembled.key(), request.key());
            assert_eq!(assembled.needs_upload(), true);

            // Without S2 there is no source for "c"...
            assert_eq!(
                try_assemble(&request, &target, &[s1], &value_sets)
                    .await
                    .unwrap(),
                None
            );
        });
    }

    #[test]
    fn a_missing_source_value_set_prevents_assembly() {
        test_async(async {
            let value_sets = LocalMap::new();
            let target = element_set("E", &["a", "c"]);
            let s1 = Arc::new(element_set("S1", &["a"]));
            let s2 = Arc::new(element_set("S2", &["c"]));

            let request = ValueSetRequestEntry::new("ws", "flow", "E", "T", "base");
            let entry = ValueSetEntry::new(request.for_element_set("S1"), vec![1.0]);
            value_sets.put(entry.key(), entry).await.unwrap();

            // Another time stamp doesn't count...
            let entry = ValueSetEntry::new(
                ValueSetRequestEntry::new("ws", "flow", "S2", "T2", "base"),
                vec![3.0],
            );
            value_sets.put(entry.key(), entry).await.unwrap();

            assert_eq!(
                try_assemble(&request, &target, &[s1, s2], &value_sets)
                    .await
                    .unwrap(),
                None
            );
        });
    }

    #[test]
    fn assembly_can_be_spawned_onto_the_runtime() {
        test_async(async {
            let value_sets = Arc::new(LocalMap::new());
            let target = element_set("E", &["a", "b"]);
            let s1 = Arc::new(element_set("S1", &["b", "a"]));

            let request = ValueSetRequestEntry::new("ws", "flow", "E", "T", "base");
            let entry = ValueSetEntry::new(request.for_element_set("S1"), vec![1.0, 2.0]);
            value_sets.put(entry.key(), entry).await.unwrap();

            // Spawning requires the future to be Send, as the fetch worker needs it to be...
            let assembled = tokio::spawn(async move {
                try_assemble(&request, &target, &[s1], value_sets.as_ref()).await
            })
            .await
            .unwrap()
            .unwrap()
            .unwrap();
            assert_eq!(assembled.values(), &[2.0, 1.0]);
        });
    }
}
