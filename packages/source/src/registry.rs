//! Source registry. Loads every source definition from embedded TOML.
//!
//! Each `.toml` file in `packages/source/sources/` is baked into the binary
//! at compile time via [`include_str!`] and parsed once on first use.

use std::sync::LazyLock;

use riksdata_source_models::DataSource;

use crate::source_def::{EndpointDefinition, SourceDefinition, parse_source_toml};

/// Longest accepted raw data type identifier.
pub const MAX_DATA_TYPE_LEN: usize = 100;

/// TOML configs embedded at compile time.
const SOURCE_TOMLS: &[(&str, &str)] = &[
    ("riksdagen", include_str!("../sources/riksdagen.toml")),
    (
        "regeringskansliet",
        include_str!("../sources/regeringskansliet.toml"),
    ),
];

static REGISTRY: LazyLock<Vec<SourceDefinition>> = LazyLock::new(|| {
    SOURCE_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_source_toml(toml).unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
});

/// Why a requested data type could not be resolved to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataTypeError {
    /// The identifier was empty after trimming.
    #[error("dataType must not be empty")]
    Empty,

    /// The identifier exceeded [`MAX_DATA_TYPE_LEN`] characters.
    #[error("dataType is too long ({len} > {MAX_DATA_TYPE_LEN} characters)")]
    TooLong {
        /// Length after trimming.
        len: usize,
    },

    /// The source has no endpoint with this identifier.
    #[error("unknown dataType \"{data_type}\"; available: {available}")]
    Unknown {
        /// The normalized identifier.
        data_type: String,
        /// Comma-separated list of valid identifiers.
        available: String,
    },
}

/// Returns every configured source definition.
///
/// # Panics
///
/// Panics if any embedded TOML config is malformed.
#[must_use]
pub fn all_sources() -> &'static [SourceDefinition] {
    &REGISTRY
}

/// Returns the definition of one source.
///
/// # Panics
///
/// Panics if the embedded registry has no definition for `source`, which
/// the registry tests rule out.
#[must_use]
pub fn source(source: DataSource) -> &'static SourceDefinition {
    all_sources()
        .iter()
        .find(|s| s.id == source)
        .unwrap_or_else(|| panic!("No embedded definition for source {source}"))
}

/// Trims a raw data type, validates its length, and maps `_` to `-`.
///
/// # Errors
///
/// Returns [`DataTypeError::Empty`] or [`DataTypeError::TooLong`].
pub fn normalize_data_type(raw: &str) -> Result<String, DataTypeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DataTypeError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_DATA_TYPE_LEN {
        return Err(DataTypeError::TooLong { len });
    }
    Ok(trimmed.replace('_', "-"))
}

/// Resolves a raw data type to its source and endpoint definitions.
///
/// # Errors
///
/// Returns [`DataTypeError`] if the identifier is invalid or unknown.
pub fn lookup(
    data_source: DataSource,
    raw_data_type: &str,
) -> Result<(&'static SourceDefinition, &'static EndpointDefinition), DataTypeError> {
    let data_type = normalize_data_type(raw_data_type)?;
    let def = source(data_source);
    def.endpoint(&data_type)
        .map(|endpoint| (def, endpoint))
        .ok_or_else(|| DataTypeError::Unknown {
            data_type,
            available: def.available_data_types(),
        })
}

/// Returns `true` if `table` is a destination table of some endpoint.
///
/// Persistence layers use this to whitelist table names before
/// interpolating them into SQL.
#[must_use]
pub fn is_known_table(table: &str) -> bool {
    all_sources()
        .iter()
        .flat_map(|s| s.endpoints.iter())
        .any(|e| e.table == table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_all_sources() {
        assert_eq!(all_sources().len(), DataSource::all().len());
        assert_eq!(source(DataSource::Riksdagen).endpoints.len(), 4);
        assert_eq!(source(DataSource::Regeringskansliet).endpoints.len(), 28);
    }

    #[test]
    fn data_types_are_unique_per_source() {
        for def in all_sources() {
            let mut types: Vec<&str> = def.endpoints.iter().map(|e| e.data_type.as_str()).collect();
            let count = types.len();
            types.sort_unstable();
            types.dedup();
            assert_eq!(types.len(), count, "{}: duplicate data types", def.id);
        }
    }

    #[test]
    fn all_endpoints_have_required_fields() {
        for def in all_sources() {
            assert!(!def.base_origin.is_empty(), "{}: empty base_origin", def.id);
            assert!(!def.bucket.is_empty(), "{}: empty bucket", def.id);
            for endpoint in &def.endpoints {
                assert!(!endpoint.url.is_empty(), "{}: empty url", endpoint.data_type);
                assert!(!endpoint.table.is_empty(), "{}: empty table", endpoint.data_type);
                assert!(
                    !endpoint.data_type.contains('_'),
                    "{}: data types are hyphenated",
                    endpoint.data_type
                );
            }
        }
    }

    #[test]
    fn normalizes_underscores_and_whitespace() {
        assert_eq!(
            normalize_data_type("  mr_granskningar ").unwrap(),
            "mr-granskningar"
        );
    }

    #[test]
    fn rejects_empty_and_overlong_data_types() {
        assert_eq!(normalize_data_type("   "), Err(DataTypeError::Empty));
        assert_eq!(
            normalize_data_type(&"x".repeat(101)),
            Err(DataTypeError::TooLong { len: 101 })
        );
        assert!(normalize_data_type(&"x".repeat(100)).is_ok());
    }

    #[test]
    fn lookup_reports_available_types_for_unknown() {
        let err = lookup(DataSource::Riksdagen, "motioner").unwrap_err();
        match err {
            DataTypeError::Unknown {
                data_type,
                available,
            } => {
                assert_eq!(data_type, "motioner");
                assert!(available.contains("dokument"));
                assert!(available.contains("voteringar"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lookup_resolves_underscore_alias() {
        let (def, endpoint) = lookup(DataSource::Regeringskansliet, "ud_avrader").unwrap();
        assert_eq!(def.id, DataSource::Regeringskansliet);
        assert_eq!(endpoint.table, "regeringskansliet_ud_avrader");
    }

    #[test]
    fn known_tables_are_whitelisted() {
        assert!(is_known_table("riksdagen_dokument"));
        assert!(!is_known_table("users; drop table users"));
    }
}
