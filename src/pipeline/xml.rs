//! XML to JSON normalization
//!
//! Elements become object keys, attributes are stored under `attr<name>`,
//! repeated siblings collapse into arrays, and text of an element that also
//! has attributes or children is stored under `content`. Leaf elements
//! become plain strings.

use crate::error::{HeliosError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::{Map, Value};

const ATTR_PREFIX: &str = "attr";
const CONTENT_KEY: &str = "content";

/// Whether a payload carries an XML declaration
pub fn is_xml(payload: &str) -> bool {
    payload.trim_start().starts_with("<?xml")
}

struct Node {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut fields = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| HeliosError::transform(format!("xml: {}", e)))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| HeliosError::transform(format!("xml: {}", e)))?;
            fields.insert(
                format!("{}{}", ATTR_PREFIX, key),
                Value::String(value.into_owned()),
            );
        }
        Ok(Node {
            name,
            fields,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let value = if self.fields.is_empty() {
            Value::String(self.text)
        } else {
            let mut fields = self.fields;
            if !self.text.is_empty() {
                fields.insert(CONTENT_KEY.to_string(), Value::String(self.text));
            }
            Value::Object(fields)
        };
        (self.name, value)
    }

    fn add_child(&mut self, name: String, value: Value) {
        match self.fields.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                self.fields.insert(name, value);
            }
        }
    }
}

/// Convert an XML document into a JSON tree rooted at its document element
pub fn to_json(payload: &str) -> Result<Value> {
    let mut reader = Reader::from_str(payload);
    reader.trim_text(true);

    let mut root = Node {
        name: String::new(),
        fields: Map::new(),
        text: String::new(),
    };
    let mut stack: Vec<Node> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| HeliosError::transform(format!("xml: {}", e)))?;
        match event {
            Event::Start(start) => stack.push(Node::open(&start)?),
            Event::Empty(start) => {
                let (name, value) = Node::open(&start)?.close();
                stack.last_mut().unwrap_or(&mut root).add_child(name, value);
            }
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| HeliosError::transform(format!("xml: {}", e)))?;
                    node.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| HeliosError::transform("xml: unbalanced end tag"))?;
                let (name, value) = node.close();
                stack.last_mut().unwrap_or(&mut root).add_child(name, value);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(HeliosError::transform("xml: unexpected end of document"));
    }
    Ok(Value::Object(root.fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detects_declaration() {
        assert!(is_xml("  <?xml version=\"1.0\"?><a/>"));
        assert!(!is_xml("<a/>"));
        assert!(!is_xml("{\"a\":1}"));
    }

    #[test]
    fn test_converts_attributes_and_repeats() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<status id="7">
  <power unit="W">1200</power>
  <phase>1</phase>
  <phase>2</phase>
  <empty/>
</status>"#;
        let value = to_json(doc).unwrap();
        assert_eq!(
            value,
            json!({
                "status": {
                    "attrid": "7",
                    "power": {"attrunit": "W", "content": "1200"},
                    "phase": ["1", "2"],
                    "empty": ""
                }
            })
        );
    }

    #[test]
    fn test_rejects_truncated_document() {
        assert!(to_json("<?xml version=\"1.0\"?><a><b>1</b>").is_err());
    }
}
