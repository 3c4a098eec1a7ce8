//! Contains the entities which are cached, requested and delivered by a node.
//!
//! A [ValueSetEntry] is a vector of readings for one element set at one point in time. It is
//! identified by the five fields of a [ValueSetRequestEntry] which is also what producers push
//! into the request queue to have a value set fetched. The reference data needed to interpret a
//! value set is kept in [ElementSetEntry] (which element sits at which index) and
//! [WebServiceEntry] (where and how to fetch the data).
//!
//! All entries are keyed by [create_key] which wraps each field in braces and escapes braces and
//! backslashes within a field. Therefore two identities which differ in any field always yield
//! different keys.
mod element_set;
mod value_set;
mod web_service;

pub use element_set::ElementSetEntry;
pub use value_set::{ValueSetEntry, ValueSetRequestEntry};
pub use web_service::WebServiceEntry;

/// Computes the cache key for the given identity fields.
///
/// # Examples
///
/// ```
/// # use datastore::data::create_key;
/// assert_eq!(create_key("ws", "q", "es", "2014-01-01", "base"), "{ws}{q}{es}{2014-01-01}{base}");
///
/// // Delimiters within a field are escaped so that they cannot shift field boundaries...
/// assert_ne!(
///     create_key("a}{b", "c", "es", "t", "s"),
///     create_key("a", "b}{c", "es", "t", "s")
/// );
/// ```
pub fn create_key(
    web_service_id: &str,
    quantity_id: &str,
    element_set_id: &str,
    time_stamp: &str,
    scenario_id: &str,
) -> String {
    let fields = [
        web_service_id,
        quantity_id,
        element_set_id,
        time_stamp,
        scenario_id,
    ];

    let mut key = String::with_capacity(fields.iter().map(|field| field.len() + 2).sum());
    for field in fields {
        key.push('{');
        for ch in field.chars() {
            if matches!(ch, '{' | '}' | '\\') {
                key.push('\\');
            }
            key.push(ch);
        }
        key.push('}');
    }

    key
}
