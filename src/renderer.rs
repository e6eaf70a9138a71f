// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Encoding of representations into response media types.

use crate::error::ApiError;
use crate::server::best_response_type;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tide::http::{content::Accept, mime, Mime};

/// Encodes plain data in one media type.
///
/// `None` means there is no data to send, and always renders to an empty body.
pub trait Renderer: Send + Sync {
    fn media_type(&self) -> Mime;
    fn format(&self) -> &'static str;
    fn render(&self, data: Option<&Value>) -> Result<Vec<u8>, ApiError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn media_type(&self) -> Mime {
        mime::JSON
    }

    fn format(&self) -> &'static str {
        "json"
    }

    fn render(&self, data: Option<&Value>) -> Result<Vec<u8>, ApiError> {
        match data {
            None => Ok(Vec::new()),
            Some(data) => {
                serde_json::to_vec(data).map_err(|err| ApiError::internal(err.to_string()))
            }
        }
    }
}

/// Renders data as an XML document rooted at `<response>`.
///
/// Object keys become child elements, list elements become `<item>` children, and `null`
/// becomes an empty element.
#[derive(Clone, Copy, Debug, Default)]
pub struct XmlRenderer;

const XML_ROOT: &str = "response";
const XML_ITEM: &str = "item";

impl Renderer for XmlRenderer {
    fn media_type(&self) -> Mime {
        mime::XML
    }

    fn format(&self) -> &'static str {
        "xml"
    }

    fn render(&self, data: Option<&Value>) -> Result<Vec<u8>, ApiError> {
        match data {
            None => Ok(Vec::new()),
            Some(data) => {
                let mut writer = Writer::new(Vec::new());
                write_element(&mut writer, XML_ROOT, data)?;
                Ok(writer.into_inner())
            }
        }
    }
}

/// Whether `name` can be used as an element name.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        _ => false,
    }
}

fn write_element<W: Write>(writer: &mut Writer<W>, tag: &str, data: &Value) -> Result<(), ApiError> {
    if !is_xml_name(tag) {
        return Err(ApiError::internal(format!(
            "unable to render XML: `{}` is not a valid element name",
            tag
        )));
    }
    if data.is_null() {
        return write_event(writer, Event::Empty(BytesStart::new(tag)));
    }
    write_event(writer, Event::Start(BytesStart::new(tag)))?;
    match data {
        Value::Array(items) => {
            for item in items {
                write_element(writer, XML_ITEM, item)?;
            }
        }
        Value::Object(fields) => {
            for (key, value) in fields {
                write_element(writer, key, value)?;
            }
        }
        Value::String(text) => write_event(writer, Event::Text(BytesText::new(text)))?,
        other => {
            let text = other.to_string();
            write_event(writer, Event::Text(BytesText::new(&text)))?;
        }
    }
    write_event(writer, Event::End(BytesEnd::new(tag)))
}

fn write_event<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<(), ApiError> {
    writer
        .write_event(event)
        .map_err(|err| ApiError::internal(format!("unable to render XML: {}", err)))
}

/// The renderers a viewset offers when none are configured, the first being the default.
pub fn default_renderers() -> Vec<Arc<dyn Renderer>> {
    vec![Arc::new(JsonRenderer), Arc::new(XmlRenderer)]
}

/// Pick the renderer the client prefers, according to its `Accept` header.
pub fn negotiate(
    renderers: &[Arc<dyn Renderer>],
    accept: &mut Option<Accept>,
) -> Result<Arc<dyn Renderer>, ApiError> {
    let available = renderers.iter().map(|r| r.media_type()).collect::<Vec<_>>();
    let chosen = best_response_type(accept, &available)?;
    renderers
        .iter()
        .find(|r| r.media_type().essence() == chosen.essence())
        .cloned()
        .ok_or_else(|| ApiError::unacceptable("No suitable Content-Type found"))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn xml(data: &Value) -> String {
        String::from_utf8(XmlRenderer.render(Some(data)).unwrap()).unwrap()
    }

    #[test]
    fn json() {
        let data = json!({"number": 1, "text": "a", "id": 3});
        assert_eq!(
            JsonRenderer.render(Some(&data)).unwrap(),
            br#"{"number":1,"text":"a","id":3}"#.to_vec()
        );
        assert!(JsonRenderer.render(None).unwrap().is_empty());
        assert_eq!(JsonRenderer.format(), "json");
    }

    #[test]
    fn xml_objects() {
        assert_eq!(
            xml(&json!({"number": 1, "text": "a & b", "tags": ["x", "y"], "none": null})),
            "<response><number>1</number><text>a &amp; b</text>\
             <tags><item>x</item><item>y</item></tags><none/></response>"
        );
    }

    #[test]
    fn xml_lists_and_scalars() {
        assert_eq!(
            xml(&json!([{"id": 1}, {"id": 2}])),
            "<response><item><id>1</id></item><item><id>2</id></item></response>"
        );
        assert_eq!(xml(&json!(true)), "<response>true</response>");
        assert!(XmlRenderer.render(None).unwrap().is_empty());
        assert_eq!(XmlRenderer.format(), "xml");
    }

    #[test]
    fn xml_rejects_keys_which_are_not_element_names() {
        for key in &["my key", "1abc", "", "a<b", "-x"] {
            let mut data = serde_json::Map::new();
            data.insert(key.to_string(), json!(1));
            let err = XmlRenderer.render(Some(&Value::Object(data))).unwrap_err();
            assert!(matches!(err, ApiError::Internal { .. }), "{:?}", key);
        }
        assert_eq!(
            xml(&json!({"snake_case": 1, "dotted.name-2": 2, "élan": 3})),
            "<response><snake_case>1</snake_case><dotted.name-2>2</dotted.name-2>\
             <élan>3</élan></response>"
        );
    }

    #[test]
    fn negotiation_defaults_to_the_first_renderer() {
        let renderers = default_renderers();
        let chosen = negotiate(&renderers, &mut None).unwrap();
        assert_eq!(chosen.format(), "json");
    }
}
