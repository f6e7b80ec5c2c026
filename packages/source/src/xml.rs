//! Structural parsing of Riksdagen's XML list responses.
//!
//! The list documents look like
//!
//! ```xml
//! <anforandelista antal="200" sidor="12" traffar="2345" nasta_sida="...">
//!   <anforande>
//!     <anforande_id>...</anforande_id>
//!     ...
//!   </anforande>
//! </anforandelista>
//! ```
//!
//! Root attributes carry page metadata and each item element becomes a
//! flat JSON object of its child elements' text, so XML items flow through
//! the same field mappings as JSON ones.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

/// A parsed XML list page.
#[derive(Debug, Default)]
pub struct XmlPage {
    /// Attributes of the root element.
    pub root_attributes: BTreeMap<String, String>,
    /// One JSON object per item element.
    pub items: Vec<Value>,
}

/// Why an XML list document could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    /// The document is not well-formed XML.
    #[error("malformed XML: {0}")]
    Malformed(#[from] quick_xml::Error),

    /// The document has no root element.
    #[error("XML document has no root element")]
    MissingRoot,

    /// The document ended inside an open element.
    #[error("XML document ended inside an open element")]
    Truncated,
}

struct OpenItem {
    fields: Map<String, Value>,
    field: Option<(String, String)>,
}

/// Parses an XML list document, collecting every `item_element` directly
/// below the root.
///
/// # Errors
///
/// Returns [`XmlError`] if the document is malformed, empty, or truncated.
pub fn parse_list(body: &str, item_element: &str) -> Result<XmlPage, XmlError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut page = XmlPage::default();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut item: Option<OpenItem> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                let name = element_name(&e);
                match depth {
                    1 => {
                        saw_root = true;
                        page.root_attributes = attributes(&e)?;
                    }
                    2 if name == item_element => {
                        item = Some(OpenItem {
                            fields: Map::new(),
                            field: None,
                        });
                    }
                    3 => {
                        if let Some(open) = item.as_mut() {
                            open.field = Some((name, String::new()));
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = element_name(&e);
                match depth + 1 {
                    1 => {
                        saw_root = true;
                        page.root_attributes = attributes(&e)?;
                    }
                    2 if name == item_element => {
                        page.items.push(Value::Object(Map::new()));
                    }
                    3 => {
                        if let Some(open) = item.as_mut() {
                            open.fields.insert(name, Value::Null);
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let Some((_, value)) = item.as_mut().and_then(|open| open.field.as_mut()) {
                    value.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, value)) = item.as_mut().and_then(|open| open.field.as_mut()) {
                    value.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                match depth {
                    2 => {
                        if let Some(open) = item.take() {
                            page.items.push(Value::Object(open.fields));
                        }
                    }
                    3 => {
                        if let Some(open) = item.as_mut()
                            && let Some((name, value)) = open.field.take()
                        {
                            open.fields.insert(name, Value::String(value));
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(XmlError::MissingRoot);
    }
    if depth != 0 || item.is_some() {
        return Err(XmlError::Truncated);
    }

    Ok(page)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>, quick_xml::Error> {
    let mut map = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        map.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(map)
}
