#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Data source identifiers, fetch filters, and the canonical mapped record
//! format.
//!
//! Every remote item (a Riksdagen document, a member of parliament, a press
//! release from the regeringen.se mirror, ...) is projected into a
//! [`MappedRecord`] before it reaches the upsert sink. A mapped record knows
//! its destination table, its natural key, and any attachments that need to
//! be downloaded later by the file worker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The remote system a data type is fetched from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataSource {
    /// Riksdagen's open data API (`data.riksdagen.se`).
    Riksdagen,
    /// The `g0v.se` mirror of regeringen.se.
    Regeringskansliet,
}

impl DataSource {
    /// All known sources, in registry order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Riksdagen, Self::Regeringskansliet]
    }
}

/// Wire encoding of an endpoint's responses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseFormat {
    /// JSON with an embedded next-page URL (or no pagination at all).
    Json,
    /// XML with one element per record and attribute-style page metadata.
    Xml,
}

/// Optional filters passed through to the remote endpoint's query string.
///
/// The adapter does not interpret these beyond length caps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFilters {
    /// Earliest date (inclusive), as accepted by the remote API.
    pub date_from: Option<String>,
    /// Latest date (inclusive), as accepted by the remote API.
    pub date_to: Option<String>,
    /// Parliamentary session (riksmöte), e.g. `"2023/24"`.
    pub period: Option<String>,
    /// Document category or type.
    pub category: Option<String>,
    /// Owning organisation (committee, ministry).
    pub org: Option<String>,
    /// Records per page.
    pub page_size: Option<u32>,
    /// Free-text search.
    pub text: Option<String>,
}

/// A single typed column value of a mapped record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Text column.
    Text(String),
    /// Integer column.
    Integer(i64),
    /// Boolean column.
    Boolean(bool),
    /// Structured column (arrays, nested objects) stored as JSON.
    Json(serde_json::Value),
    /// Explicit `NULL`.
    Null,
}

impl FieldValue {
    /// Wraps an optional string, mapping `None` to [`FieldValue::Null`].
    #[must_use]
    pub fn text_opt(value: Option<String>) -> Self {
        value.map_or(Self::Null, Self::Text)
    }

    /// Wraps an optional integer, mapping `None` to [`FieldValue::Null`].
    #[must_use]
    pub fn integer_opt(value: Option<i64>) -> Self {
        value.map_or(Self::Null, Self::Integer)
    }

    /// Returns the text content if this is a [`FieldValue::Text`].
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` for [`FieldValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A remote binary file referenced by a record, to be downloaded by the
/// file worker and back-written onto the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Remote URL, possibly relative to the source's base origin.
    pub url: String,
    /// Destination bucket.
    pub bucket: String,
    /// Intended storage path (sanitized at enqueue time).
    pub storage_path: String,
    /// Column on the owning record to back-fill with the stored file URL.
    pub column: String,
}

/// A normalized projection of one remote item, ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRecord {
    /// Destination table.
    pub table: String,
    /// Column holding the natural key (the upsert conflict target).
    pub conflict_key: String,
    /// The source system's own identifier for this record.
    pub natural_key: String,
    /// Column values, including the natural key column.
    pub fields: BTreeMap<String, FieldValue>,
    /// Attachments discovered on this record.
    pub attachments: Vec<Attachment>,
}

impl MappedRecord {
    /// Creates a record with only its natural key column populated.
    #[must_use]
    pub fn new(table: &str, conflict_key: &str, natural_key: String) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(conflict_key.to_owned(), FieldValue::Text(natural_key.clone()));
        Self {
            table: table.to_owned(),
            conflict_key: conflict_key.to_owned(),
            natural_key,
            fields,
            attachments: Vec::new(),
        }
    }

    /// Sets a column value.
    #[must_use]
    pub fn with(mut self, column: &str, value: FieldValue) -> Self {
        self.fields.insert(column.to_owned(), value);
        self
    }

    /// Sets a text column from an optional string.
    #[must_use]
    pub fn with_text(self, column: &str, value: Option<String>) -> Self {
        self.with(column, FieldValue::text_opt(value))
    }

    /// Adds an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Returns the value of a column, if set.
    #[must_use]
    pub fn field(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }
}

/// Why a raw item could not be mapped into a [`MappedRecord`].
///
/// Mapping errors are always recoverable: the item is counted as an error
/// and the rest of the page continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// A required field was absent or empty.
    #[error("missing required field '{field}'")]
    MissingField {
        /// Name of the field.
        field: String,
    },

    /// A field was present but could not be interpreted.
    #[error("invalid field '{field}': {message}")]
    InvalidField {
        /// Name of the field.
        field: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The item was not an object.
    #[error("expected an object, got {found}")]
    NotAnObject {
        /// Short description of what was found instead.
        found: String,
    },
}

/// Page-level metadata reported by the remote source on a page response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    /// Total number of pages, when the source reports it.
    pub total_pages: Option<u64>,
    /// Total number of items, when the source reports it.
    pub total_items: Option<u64>,
}
