//! Generic source adapter driven by a registry endpoint definition.
//!
//! The adapter never performs I/O. Given a raw page body it produces the
//! mapped records, the continuation pointer, and any page metadata the
//! source reports.

use riksdata_source_models::{
    DataSource, FetchFilters, MappedRecord, MappingError, PageMetadata, ResponseFormat,
};
use serde_json::{Map, Value};
use url::Url;

use crate::SourceError;
use crate::mapping::{MappingContext, map_item};
use crate::parsing::{count, kind_of, one_or_many};
use crate::registry::{self, DataTypeError};
use crate::source_def::{EndpointDefinition, PayloadLayout, SourceDefinition};
use crate::xml;

/// Number of payload characters logged when an XML page fails to parse.
const PAYLOAD_PREVIEW_LEN: usize = 500;

/// Metadata keys used by Riksdagen list wrappers (JSON) and root elements
/// (XML, without the `@`).
const TOTAL_PAGES_KEY: &str = "sidor";
const TOTAL_ITEMS_KEY: &str = "traffar";
const NEXT_PAGE_KEY: &str = "nasta_sida";

/// One remote page after parsing and mapping.
#[derive(Debug, Default)]
pub struct ParsedPage {
    /// Mapping result for every item on the page, in payload order.
    pub records: Vec<Result<MappedRecord, MappingError>>,
    /// URL of the next page, if the source reports one and pagination is on.
    pub next_page: Option<String>,
    /// Totals reported on this page.
    pub metadata: PageMetadata,
    /// `true` when the page body could not be parsed structurally and the
    /// run should stop paginating.
    pub parse_failed: bool,
}

/// A source endpoint bound to the generic page parser.
#[derive(Debug, Clone, Copy)]
pub struct SourceAdapter {
    source: &'static SourceDefinition,
    endpoint: &'static EndpointDefinition,
}

impl SourceAdapter {
    /// Resolves a raw data type against the embedded registry.
    ///
    /// # Errors
    ///
    /// Returns [`DataTypeError`] if the data type is invalid or unknown.
    pub fn resolve(source: DataSource, raw_data_type: &str) -> Result<Self, DataTypeError> {
        let (source, endpoint) = registry::lookup(source, raw_data_type)?;
        Ok(Self { source, endpoint })
    }

    /// Normalized data type.
    #[must_use]
    pub fn data_type(&self) -> &'static str {
        &self.endpoint.data_type
    }

    /// Destination table.
    #[must_use]
    pub fn table(&self) -> &'static str {
        &self.endpoint.table
    }

    /// Origin relative attachment URLs are resolved against.
    #[must_use]
    pub fn base_origin(&self) -> &'static str {
        &self.source.base_origin
    }

    /// Full endpoint definition.
    #[must_use]
    pub const fn endpoint(&self) -> &'static EndpointDefinition {
        self.endpoint
    }

    /// Builds the first page URL, passing filters through to the query
    /// string. A filter overrides an existing parameter of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Url`] if the registry URL is malformed.
    pub fn first_page_url(&self, filters: &FetchFilters) -> Result<String, SourceError> {
        let overrides = self.source.filter_params.query_pairs(filters);
        if overrides.is_empty() {
            return Ok(self.endpoint.url.clone());
        }

        let mut url = Url::parse(&self.endpoint.url)?;
        let existing: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (key, value) in &existing {
                let value = overrides
                    .iter()
                    .find(|(k, _)| k == key)
                    .map_or(value, |(_, v)| v);
                query.append_pair(key, value);
            }
            for (key, value) in &overrides {
                if !existing.iter().any(|(k, _)| k == key) {
                    query.append_pair(key, value);
                }
            }
        }

        Ok(url.into())
    }

    /// Parses one page body.
    ///
    /// When `paginate` is `false` (or the endpoint is not paginated) the
    /// next page pointer is always `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Json`] for undecodable JSON (treated as a
    /// transient fetch failure) and [`SourceError::Normalization`] when the
    /// payload has the wrong top-level shape. XML parse failures are not
    /// errors; they set [`ParsedPage::parse_failed`].
    pub fn parse_page(&self, body: &str, paginate: bool) -> Result<ParsedPage, SourceError> {
        let follow = paginate && self.endpoint.paginated;
        match self.endpoint.format {
            ResponseFormat::Json => self.parse_json(body, follow),
            ResponseFormat::Xml => Ok(self.parse_xml(body, follow)),
        }
    }

    fn parse_json(&self, body: &str, follow: bool) -> Result<ParsedPage, SourceError> {
        let value: Value = serde_json::from_str(body)?;

        match self.endpoint.layout {
            PayloadLayout::Wrapped => {
                let wrapper = self
                    .endpoint
                    .list_key
                    .as_deref()
                    .and_then(|key| value.get(key))
                    .cloned()
                    .unwrap_or(Value::Null);
                let attr = |name: &str| wrapper.get(format!("@{name}"));

                let items = self
                    .endpoint
                    .item_key
                    .as_deref()
                    .map(|key| one_or_many(wrapper.get(key)))
                    .unwrap_or_default();

                Ok(ParsedPage {
                    records: self.map_all(&items),
                    next_page: follow
                        .then(|| attr(NEXT_PAGE_KEY).and_then(Value::as_str))
                        .flatten()
                        .and_then(non_empty),
                    metadata: PageMetadata {
                        total_pages: count(attr(TOTAL_PAGES_KEY)),
                        total_items: count(attr(TOTAL_ITEMS_KEY)),
                    },
                    parse_failed: false,
                })
            }
            PayloadLayout::Array => {
                let items = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(SourceError::Normalization {
                            message: format!(
                                "{}: expected an array, got {}",
                                self.endpoint.data_type,
                                kind_of(&other)
                            ),
                        });
                    }
                };
                Ok(self.single_page(&items))
            }
            PayloadLayout::CodeMap => {
                let Value::Object(entries) = value else {
                    return Err(SourceError::Normalization {
                        message: format!(
                            "{}: expected an object of codes, got {}",
                            self.endpoint.data_type,
                            kind_of(&value)
                        ),
                    });
                };
                let items: Vec<Value> = entries
                    .into_iter()
                    .map(|(kod, namn)| {
                        let mut item = Map::new();
                        item.insert("kod".to_string(), Value::String(kod));
                        item.insert("namn".to_string(), namn);
                        Value::Object(item)
                    })
                    .collect();
                Ok(self.single_page(&items))
            }
        }
    }

    fn parse_xml(&self, body: &str, follow: bool) -> ParsedPage {
        let item_key = self.endpoint.item_key.as_deref().unwrap_or_default();

        match xml::parse_list(body, item_key) {
            Ok(page) => {
                let attr = |name: &str| page.root_attributes.get(name).map(String::as_str);
                ParsedPage {
                    records: self.map_all(&page.items),
                    next_page: follow
                        .then(|| attr(NEXT_PAGE_KEY))
                        .flatten()
                        .and_then(non_empty),
                    metadata: PageMetadata {
                        total_pages: attr(TOTAL_PAGES_KEY).and_then(|v| v.trim().parse().ok()),
                        total_items: attr(TOTAL_ITEMS_KEY).and_then(|v| v.trim().parse().ok()),
                    },
                    parse_failed: false,
                }
            }
            Err(e) => {
                let preview: String = body.chars().take(PAYLOAD_PREVIEW_LEN).collect();
                log::warn!(
                    "[{}/{}] XML parse failed, ending pagination: {e}\n  payload preview: {preview}",
                    self.source.id,
                    self.endpoint.data_type,
                );
                ParsedPage {
                    parse_failed: true,
                    ..ParsedPage::default()
                }
            }
        }
    }

    fn single_page(&self, items: &[Value]) -> ParsedPage {
        ParsedPage {
            records: self.map_all(items),
            next_page: None,
            metadata: PageMetadata {
                total_pages: Some(1),
                total_items: Some(items.len() as u64),
            },
            parse_failed: false,
        }
    }

    fn map_all(&self, items: &[Value]) -> Vec<Result<MappedRecord, MappingError>> {
        let ctx = MappingContext {
            endpoint: self.endpoint,
            bucket: &self.source.bucket,
        };
        items.iter().map(|item| map_item(&ctx, item)).collect()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn adapter(source: DataSource, data_type: &str) -> SourceAdapter {
        SourceAdapter::resolve(source, data_type).unwrap()
    }

    #[test]
    fn first_page_url_is_unchanged_without_filters() {
        let a = adapter(DataSource::Riksdagen, "dokument");
        assert_eq!(
            a.first_page_url(&FetchFilters::default()).unwrap(),
            a.endpoint().url
        );
    }

    #[test]
    fn filters_override_existing_query_parameters() {
        let a = adapter(DataSource::Riksdagen, "dokument");
        let url = a
            .first_page_url(&FetchFilters {
                category: Some("mot".to_string()),
                period: Some("2023/24".to_string()),
                date_from: Some("2024-01-01".to_string()),
                ..FetchFilters::default()
            })
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

        assert!(pairs.contains(&("doktyp".to_string(), "mot".to_string())));
        assert!(pairs.contains(&("rm".to_string(), "2023/24".to_string())));
        assert!(pairs.contains(&("from".to_string(), "2024-01-01".to_string())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "doktyp").count(), 1);
        assert!(pairs.contains(&("utformat".to_string(), "json".to_string())));
    }

    #[test]
    fn wrapped_json_page_yields_records_and_next_pointer() {
        let a = adapter(DataSource::Riksdagen, "dokument");
        let body = json!({
            "dokumentlista": {
                "@sidor": "2",
                "@traffar": "20",
                "@nasta_sida": "https://data.riksdagen.se/dokumentlista/?p=2&utformat=json",
                "dokument": [
                    {"dok_id": "A1", "titel": "Ett"},
                    {"titel": "saknar id"}
                ]
            }
        })
        .to_string();

        let page = a.parse_page(&body, true).unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.records[0].is_ok());
        assert!(page.records[1].is_err());
        assert_eq!(
            page.next_page.as_deref(),
            Some("https://data.riksdagen.se/dokumentlista/?p=2&utformat=json")
        );
        assert_eq!(page.metadata.total_pages, Some(2));
        assert_eq!(page.metadata.total_items, Some(20));
    }

    #[test]
    fn single_item_wrapper_is_normalized_to_sequence() {
        let a = adapter(DataSource::Riksdagen, "voteringar");
        let body = json!({
            "voteringlista": {"votering": {"votering_id": "V1", "punkt": "2"}}
        })
        .to_string();
        let page = a.parse_page(&body, true).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_page, None);
    }

    #[test]
    fn paginate_false_ignores_next_pointer() {
        let a = adapter(DataSource::Riksdagen, "dokument");
        let body = json!({
            "dokumentlista": {"@nasta_sida": "https://data.riksdagen.se/p2", "dokument": []}
        })
        .to_string();
        assert_eq!(a.parse_page(&body, false).unwrap().next_page, None);
    }

    #[test]
    fn unpaginated_endpoint_ignores_next_pointer() {
        let a = adapter(DataSource::Riksdagen, "ledamoter");
        let body = json!({
            "personlista": {"@nasta_sida": "https://data.riksdagen.se/p2", "person": []}
        })
        .to_string();
        assert_eq!(a.parse_page(&body, true).unwrap().next_page, None);
    }

    #[test]
    fn truncated_json_is_an_error() {
        let a = adapter(DataSource::Riksdagen, "dokument");
        assert!(matches!(
            a.parse_page("{\"dokumentlista\": {", true),
            Err(SourceError::Json(_))
        ));
    }

    #[test]
    fn xml_page_reports_attribute_metadata() {
        let a = adapter(DataSource::Riksdagen, "anforanden");
        let body = r#"<anforandelista sidor="4" traffar="31" nasta_sida="https://data.riksdagen.se/anforandelista/?p=2">
            <anforande><anforande_id>x1</anforande_id><namn>Talare</namn></anforande>
        </anforandelista>"#;
        let page = a.parse_page(body, true).unwrap();
        assert!(!page.parse_failed);
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.metadata.total_pages, Some(4));
        assert_eq!(
            page.next_page.as_deref(),
            Some("https://data.riksdagen.se/anforandelista/?p=2")
        );
    }

    #[test]
    fn broken_xml_ends_pagination_without_error() {
        let a = adapter(DataSource::Riksdagen, "anforanden");
        let page = a.parse_page("<anforandelista><anforande>", true).unwrap();
        assert!(page.parse_failed);
        assert!(page.records.is_empty());
        assert_eq!(page.next_page, None);
    }

    #[test]
    fn array_layout_is_a_single_page() {
        let a = adapter(DataSource::Regeringskansliet, "pressmeddelanden");
        let body = json!([{"id": "1"}, {"id": "2"}, {"url": "https://www.regeringen.se/x/"}]).to_string();
        let page = a.parse_page(&body, true).unwrap();
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.next_page, None);
        assert_eq!(page.metadata.total_items, Some(3));
        assert_eq!(page.metadata.total_pages, Some(1));
    }

    #[test]
    fn array_layout_rejects_objects() {
        let a = adapter(DataSource::Regeringskansliet, "tal");
        assert!(matches!(
            a.parse_page("{\"items\": []}", true),
            Err(SourceError::Normalization { .. })
        ));
    }

    #[test]
    fn code_map_entries_become_records() {
        let a = adapter(DataSource::Regeringskansliet, "kategorier");
        let page = a
            .parse_page(&json!({"101": "Arbetsmarknad", "102": "Bostäder"}).to_string(), true)
            .unwrap();
        let keys: Vec<String> = page
            .records
            .into_iter()
            .map(|r| r.unwrap().natural_key)
            .collect();
        assert_eq!(keys, vec!["101".to_string(), "102".to_string()]);
    }
}
