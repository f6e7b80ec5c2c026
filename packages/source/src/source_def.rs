//! Config-driven source and endpoint definitions.
//!
//! [`SourceDefinition`] captures everything unique about one remote system:
//! its base origin (for resolving relative attachment URLs), the bucket its
//! files land in, how fetch filters map onto its query string, and the list
//! of data types it serves. A single generic adapter handles every endpoint.

use riksdata_source_models::{DataSource, FetchFilters, ResponseFormat};
use serde::Deserialize;

/// Maximum length of the free-text filter passed to a remote endpoint.
pub const MAX_TEXT_FILTER_LEN: usize = 200;

/// Maximum length of every other string filter.
pub const MAX_FILTER_LEN: usize = 100;

/// A remote system and every data type it serves.
#[derive(Debug, Deserialize)]
pub struct SourceDefinition {
    /// Source identifier.
    pub id: DataSource,
    /// Human-readable name.
    pub name: String,
    /// Origin that relative attachment URLs are resolved against.
    pub base_origin: String,
    /// Object storage bucket for this source's attachments.
    pub bucket: String,
    /// Mapping from filter name to remote query parameter name.
    #[serde(default)]
    pub filter_params: FilterParams,
    /// Every data type served by this source.
    pub endpoints: Vec<EndpointDefinition>,
}

impl SourceDefinition {
    /// Looks up an endpoint by its (already normalized) data type.
    #[must_use]
    pub fn endpoint(&self, data_type: &str) -> Option<&EndpointDefinition> {
        self.endpoints.iter().find(|e| e.data_type == data_type)
    }

    /// Comma-separated list of every data type, for error messages.
    #[must_use]
    pub fn available_data_types(&self) -> String {
        self.endpoints
            .iter()
            .map(|e| e.data_type.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Remote query parameter names for each supported filter. A filter whose
/// parameter name is unset is not forwarded.
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    /// Parameter for [`FetchFilters::date_from`].
    pub date_from: Option<String>,
    /// Parameter for [`FetchFilters::date_to`].
    pub date_to: Option<String>,
    /// Parameter for [`FetchFilters::period`].
    pub period: Option<String>,
    /// Parameter for [`FetchFilters::category`].
    pub category: Option<String>,
    /// Parameter for [`FetchFilters::org`].
    pub org: Option<String>,
    /// Parameter for [`FetchFilters::page_size`].
    pub page_size: Option<String>,
    /// Parameter for [`FetchFilters::text`].
    pub text: Option<String>,
}

impl FilterParams {
    /// Resolves the filters into `(param, value)` pairs, applying length
    /// caps. Empty values are skipped.
    #[must_use]
    pub fn query_pairs(&self, filters: &FetchFilters) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        let mut push = |param: Option<&String>, value: Option<&str>, cap: usize| {
            if let (Some(param), Some(value)) = (param, value) {
                let value = value.trim();
                if !value.is_empty() {
                    pairs.push((param.clone(), truncate_chars(value, cap)));
                }
            }
        };

        push(
            self.date_from.as_ref(),
            filters.date_from.as_deref(),
            MAX_FILTER_LEN,
        );
        push(
            self.date_to.as_ref(),
            filters.date_to.as_deref(),
            MAX_FILTER_LEN,
        );
        push(
            self.period.as_ref(),
            filters.period.as_deref(),
            MAX_FILTER_LEN,
        );
        push(
            self.category.as_ref(),
            filters.category.as_deref(),
            MAX_FILTER_LEN,
        );
        push(self.org.as_ref(), filters.org.as_deref(), MAX_FILTER_LEN);
        push(
            self.text.as_ref(),
            filters.text.as_deref(),
            MAX_TEXT_FILTER_LEN,
        );

        if let (Some(param), Some(size)) = (&self.page_size, filters.page_size) {
            pairs.push((param.clone(), size.to_string()));
        }

        pairs
    }
}

/// One data type served by a source.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointDefinition {
    /// Normalized data type identifier (hyphenated).
    pub data_type: String,
    /// First-page URL template.
    pub url: String,
    /// Destination table.
    pub table: String,
    /// Natural key column (the upsert conflict target).
    pub conflict_key: String,
    /// Response encoding.
    pub format: ResponseFormat,
    /// Whether the endpoint follows a next-page pointer at all.
    pub paginated: bool,
    /// Where the items live in the response body.
    pub layout: PayloadLayout,
    /// Key of the wrapper object (e.g. `dokumentlista`) for wrapped layouts.
    pub list_key: Option<String>,
    /// Key of the item array inside the wrapper (e.g. `dokument`).
    pub item_key: Option<String>,
    /// Which field mapping to apply to each item.
    pub mapping: MappingKind,
}

/// Structural shape of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadLayout {
    /// `{ list_key: { "@nasta_sida": ..., item_key: [..] | {..} } }`
    Wrapped,
    /// A bare JSON array of items.
    Array,
    /// A JSON object whose entries are `code -> name` pairs.
    CodeMap,
}

/// The field mapping applied to a raw item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// Riksdagen document list entry.
    RiksdagenDokument,
    /// Riksdagen member of parliament.
    RiksdagenLedamot,
    /// Riksdagen chamber speech.
    RiksdagenAnforande,
    /// Riksdagen vote.
    RiksdagenVotering,
    /// Government press release.
    Pressmeddelande,
    /// Government bill.
    Proposition,
    /// Category code and name.
    Kategori,
    /// Any other document series from the mirror.
    GenericDocument,
}

/// Parses a [`SourceDefinition`] from a TOML string.
///
/// # Errors
///
/// Returns a TOML deserialization error if the input is malformed.
pub fn parse_source_toml(toml_str: &str) -> Result<SourceDefinition, toml::de::Error> {
    toml::from_str(toml_str)
}

fn truncate_chars(value: &str, cap: usize) -> String {
    value.chars().take(cap).collect()
}
