//! Reads and writes the XML bodies of the **SimpleRest** protocol.
use std::collections::HashMap;
use std::sync::Arc;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::data::{ElementSetEntry, ValueSetEntry};

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &[u8], text: &str) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::borrowed_name(name)))?;
    writer.write_event(Event::Text(BytesText::from_plain_str(text)))?;
    writer.write_event(Event::End(BytesEnd::borrowed(name)))?;

    Ok(())
}

/// Formats a value with at least six integer and exactly three fractional digits.
pub fn format_value(value: f64) -> String {
    if value < 0. {
        format!("-{:010.3}", -value)
    } else {
        format!("{:010.3}", value)
    }
}

/// Renders the body of a **GetValues** request.
pub fn write_get_values(
    quantity_id: &str,
    element_ids: &[String],
    time_stamp: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::with_capacity(8192));

    writer.write_event(Event::Start(BytesStart::borrowed_name(b"valueSetRequest")))?;
    write_text_element(&mut writer, b"quantityId", quantity_id)?;
    write_text_element(&mut writer, b"dateTime", time_stamp)?;
    writer.write_event(Event::Start(BytesStart::borrowed_name(b"values")))?;
    for element_id in element_ids {
        let mut value = BytesStart::borrowed_name(b"value");
        value.push_attribute(("locationId", element_id.as_str()));
        writer.write_event(Event::Empty(value))?;
    }
    writer.write_event(Event::End(BytesEnd::borrowed(b"values")))?;
    writer.write_event(Event::End(BytesEnd::borrowed(b"valueSetRequest")))?;

    Ok(writer.into_inner())
}

/// Renders the body of a **SetValues** request.
///
/// Fails if the element ids of an entry are unknown or don't match its values.
pub fn write_set_values(
    element_sets: &HashMap<String, Arc<ElementSetEntry>>,
    entries: &[ValueSetEntry],
) -> anyhow::Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::with_capacity(8192));

    writer.write_event(Event::Start(BytesStart::borrowed_name(b"valueSets")))?;
    for entry in entries {
        let ids = element_sets
            .get(entry.element_set_id())
            .map(|element_set| element_set.element_ids())
            .ok_or_else(|| {
            anyhow::anyhow!(
                "No element ids are known for element set {}",
                entry.element_set_id()
            )
        })?;
        if ids.len() != entry.values().len() {
            return Err(anyhow::anyhow!(
                "Value set {} has {} values but element set {} has {} elements",
                entry.id(),
                entry.values().len(),
                entry.element_set_id(),
                ids.len()
            ));
        }

        writer.write_event(Event::Start(BytesStart::borrowed_name(b"valueSet")))?;
        write_text_element(&mut writer, b"timeStamp", entry.time_stamp())?;
        writer.write_event(Event::Start(BytesStart::borrowed_name(b"values")))?;
        for (element_id, value) in ids.iter().zip(entry.values()) {
            let mut start = BytesStart::borrowed_name(b"value");
            start.push_attribute(("locationId", element_id.as_str()));
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Text(BytesText::from_plain_str(&format_value(
                *value,
            ))))?;
            writer.write_event(Event::End(BytesEnd::borrowed(b"value")))?;
        }
        writer.write_event(Event::End(BytesEnd::borrowed(b"values")))?;
        writer.write_event(Event::End(BytesEnd::borrowed(b"valueSet")))?;
    }
    writer.write_event(Event::End(BytesEnd::borrowed(b"valueSets")))?;

    Ok(writer.into_inner())
}

/// Extracts the text of all **value** elements (in document order) as numbers.
pub fn read_values(data: &[u8]) -> anyhow::Result<Vec<f64>> {
    let mut reader = Reader::from_reader(data);
    let _ = reader.trim_text(true);

    let mut values = Vec::new();
    let mut buffer = Vec::new();
    let mut in_value = false;
    loop {
        match reader.read_event(&mut buffer)? {
            Event::Start(element) if element.name() == b"value" => in_value = true,
            Event::End(element) if element.name() == b"value" => in_value = false,
            Event::Text(text) if in_value => {
                let text = text.unescape_and_decode(&reader)?;
                values.push(text.trim().parse::<f64>().map_err(|error| {
                    anyhow::anyhow!("Invalid value '{}' in response: {}", text, error)
                })?);
            }
            Event::Eof => break,
            _ => (),
        }
        buffer.clear();
    }

    Ok(values)
}
