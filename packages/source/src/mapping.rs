//! Per-kind field mappings from raw payload items to [`MappedRecord`]s.
//!
//! Each mapping is a plain function over one raw item. Missing optional
//! fields become `NULL`; a missing natural key is a [`MappingError`] that
//! the driver counts as a per-item error.

use riksdata_source_models::{Attachment, FieldValue, MappedRecord, MappingError};
use serde_json::Value;

use crate::parsing::{file_name, first_text, integer, kind_of, required_text, text};
use crate::source_def::{EndpointDefinition, MappingKind};

/// Column back-filled with a stored PDF.
pub const LOCAL_PDF_COLUMN: &str = "local_pdf_url";
/// Column back-filled with a stored portrait.
pub const LOCAL_IMAGE_COLUMN: &str = "local_bild_url";
/// Column back-filled with a stored press release attachment.
pub const LOCAL_ATTACHMENTS_COLUMN: &str = "local_bilagor";
/// Column back-filled with a stored generic document attachment.
pub const LOCAL_FILES_COLUMN: &str = "local_files";

/// Everything a mapping needs to know about the endpoint being walked.
#[derive(Debug, Clone, Copy)]
pub struct MappingContext<'a> {
    /// Endpoint the item came from.
    pub endpoint: &'a EndpointDefinition,
    /// Bucket attachments are stored in.
    pub bucket: &'a str,
}

impl MappingContext<'_> {
    fn record(&self, natural_key: String) -> MappedRecord {
        MappedRecord::new(
            &self.endpoint.table,
            &self.endpoint.conflict_key,
            natural_key,
        )
    }

    fn attachment(&self, url: String, storage_path: String, column: &str) -> Attachment {
        Attachment {
            url,
            bucket: self.bucket.to_string(),
            storage_path,
            column: column.to_string(),
        }
    }
}

/// Maps one raw item according to the endpoint's [`MappingKind`].
///
/// # Errors
///
/// Returns [`MappingError`] if the item is not an object, lacks its
/// natural key, or has a malformed typed field.
pub fn map_item(ctx: &MappingContext<'_>, item: &Value) -> Result<MappedRecord, MappingError> {
    if !item.is_object() {
        return Err(MappingError::NotAnObject {
            found: kind_of(item).to_string(),
        });
    }

    match ctx.endpoint.mapping {
        MappingKind::RiksdagenDokument => map_riksdagen_dokument(ctx, item),
        MappingKind::RiksdagenLedamot => map_riksdagen_ledamot(ctx, item),
        MappingKind::RiksdagenAnforande => map_riksdagen_anforande(ctx, item),
        MappingKind::RiksdagenVotering => map_riksdagen_votering(ctx, item),
        MappingKind::Pressmeddelande => map_pressmeddelande(ctx, item),
        MappingKind::Proposition => map_proposition(ctx, item),
        MappingKind::Kategori => map_kategori(ctx, item),
        MappingKind::GenericDocument => map_generic_document(ctx, item),
    }
}

fn map_riksdagen_dokument(
    ctx: &MappingContext<'_>,
    item: &Value,
) -> Result<MappedRecord, MappingError> {
    let dok_id = required_text(item, &["dok_id", "id"])?;

    let mut record = ctx.record(dok_id.clone());
    for column in [
        "rm",
        "beteckning",
        "doktyp",
        "typ",
        "subtyp",
        "organ",
        "nummer",
        "datum",
        "systemdatum",
        "titel",
        "subtitel",
        "status",
        "dokument_url_text",
        "dokument_url_html",
    ] {
        record = record.with_text(column, text(item, column));
    }

    if let Some(url) = text(item, "dokument_url_text") {
        record = record.with_attachment(ctx.attachment(
            url,
            format!("dokument/{dok_id}.pdf"),
            LOCAL_PDF_COLUMN,
        ));
    }

    Ok(record)
}

fn map_riksdagen_ledamot(
    ctx: &MappingContext<'_>,
    item: &Value,
) -> Result<MappedRecord, MappingError> {
    let intressent_id = required_text(item, &["intressent_id"])?;
    let bild_url = first_text(item, &["bild_url_192", "bild_url_80"]);

    let mut record = ctx.record(intressent_id.clone());
    for column in [
        "fornamn",
        "efternamn",
        "tilltalsnamn",
        "parti",
        "valkrets",
        "status",
    ] {
        record = record.with_text(column, text(item, column));
    }
    record = record.with_text("bild_url", bild_url.clone());

    if let Some(url) = bild_url {
        record = record.with_attachment(ctx.attachment(
            url,
            format!("ledamoter/{intressent_id}.jpg"),
            LOCAL_IMAGE_COLUMN,
        ));
    }

    Ok(record)
}

fn map_riksdagen_anforande(
    ctx: &MappingContext<'_>,
    item: &Value,
) -> Result<MappedRecord, MappingError> {
    let anforande_id = required_text(item, &["anforande_id", "dokument_id"])?;

    Ok(ctx
        .record(anforande_id)
        .with_text("intressent_id", text(item, "intressent_id"))
        .with_text("dok_id", first_text(item, &["dokument_id", "dok_id"]))
        .with_text("debattnamn", first_text(item, &["debatt", "debattnamn"]))
        .with(
            "debattsekund",
            FieldValue::integer_opt(integer(item, "anforandenummer")?),
        )
        .with_text("anftext", text(item, "anforandetext"))
        .with_text("anfdatum", text(item, "datum"))
        .with_text(
            "avsnittsrubrik",
            first_text(item, &["rubrik", "avsnittsrubrik"]),
        )
        .with_text("parti", text(item, "parti"))
        .with_text("talare", first_text(item, &["namn", "talare"])))
}

fn map_riksdagen_votering(
    ctx: &MappingContext<'_>,
    item: &Value,
) -> Result<MappedRecord, MappingError> {
    let votering_id = required_text(item, &["votering_id"])?;

    Ok(ctx
        .record(votering_id)
        .with_text("rm", text(item, "rm"))
        .with_text("beteckning", text(item, "beteckning"))
        .with("punkt", FieldValue::integer_opt(integer(item, "punkt")?))
        .with_text("titel", text(item, "titel"))
        .with_text("votering_datum", text(item, "datum")))
}

fn map_pressmeddelande(
    ctx: &MappingContext<'_>,
    item: &Value,
) -> Result<MappedRecord, MappingError> {
    let document_id = required_text(item, &["id", "url"])?;
    let folder = text(item, "id").unwrap_or_else(|| url_slug(&document_id));

    let mut record = ctx
        .record(document_id)
        .with_text("titel", text(item, "title"))
        .with_text("publicerad_datum", text(item, "published"))
        .with_text("departement", text(item, "sender"))
        .with_text("url", text(item, "url"))
        .with_text("innehall", first_text(item, &["summary", "description"]));

    for (index, url) in attachment_urls(item).into_iter().enumerate() {
        let name = file_name(&url).map_or_else(|| format!("bilaga_{index}.pdf"), str::to_string);
        record = record.with_attachment(ctx.attachment(
            url,
            format!("pressmeddelanden/{folder}/{name}"),
            LOCAL_ATTACHMENTS_COLUMN,
        ));
    }

    Ok(record)
}

fn map_proposition(ctx: &MappingContext<'_>, item: &Value) -> Result<MappedRecord, MappingError> {
    let document_id = required_text(item, &["id", "url"])?;
    let pdf_url = attachment_urls(item).into_iter().next();
    let file_stem =
        first_text(item, &["identifier", "id"]).unwrap_or_else(|| url_slug(&document_id));

    let mut record = ctx
        .record(document_id)
        .with_text("titel", text(item, "title"))
        .with_text("publicerad_datum", text(item, "published"))
        .with_text("beteckningsnummer", text(item, "identifier"))
        .with_text("departement", text(item, "sender"))
        .with_text("url", text(item, "url"))
        .with_text("pdf_url", pdf_url.clone());

    if let Some(url) = pdf_url {
        record = record.with_attachment(ctx.attachment(
            url,
            format!("propositioner/{file_stem}.pdf"),
            LOCAL_PDF_COLUMN,
        ));
    }

    Ok(record)
}

fn map_kategori(ctx: &MappingContext<'_>, item: &Value) -> Result<MappedRecord, MappingError> {
    let kod = required_text(item, &["kod"])?;
    let namn = match item.get("namn") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };

    Ok(ctx.record(kod).with_text("namn", namn))
}

fn map_generic_document(
    ctx: &MappingContext<'_>,
    item: &Value,
) -> Result<MappedRecord, MappingError> {
    let document_id = required_text(item, &["id", "url"])?;
    let folder = text(item, "id").unwrap_or_else(|| url_slug(&document_id));
    let url = text(item, "url");
    let kategorier = match item.get("categories") {
        None | Some(Value::Null) => FieldValue::Null,
        Some(value) => FieldValue::Json(value.clone()),
    };

    let mut record = ctx
        .record(document_id)
        .with_text("titel", text(item, "title"))
        .with_text("publicerad_datum", text(item, "published"))
        .with_text("uppdaterad_datum", text(item, "updated"))
        .with_text("typ", text(item, "type"))
        .with("kategorier", kategorier)
        .with_text("avsandare", text(item, "sender"))
        .with_text("beteckningsnummer", text(item, "identifier"))
        .with_text("markdown_url", url.as_deref().map(markdown_url))
        .with_text("url", url);

    for (index, url) in attachment_urls(item).into_iter().enumerate() {
        let name = file_name(&url).map_or_else(|| format!("file_{index}"), str::to_string);
        record = record.with_attachment(ctx.attachment(
            url,
            format!("{}/{folder}/{name}", ctx.endpoint.data_type),
            LOCAL_FILES_COLUMN,
        ));
    }

    Ok(record)
}

/// Derives the mirror's markdown rendition URL from a regeringen.se URL.
#[must_use]
pub fn markdown_url(url: &str) -> String {
    let mirrored = url.replacen("regeringen.se", "g0v.se", 1);
    mirrored
        .strip_suffix('/')
        .map_or_else(|| mirrored.clone(), |stem| format!("{stem}.md"))
}

/// Last non-empty path segment of a URL, used to name storage folders for
/// items that only carry a URL.
fn url_slug(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("item")
        .to_string()
}

fn attachment_urls(item: &Value) -> Vec<String> {
    item.get("attachments")
        .and_then(Value::as_array)
        .map(|attachments| {
            attachments
                .iter()
                .filter_map(|a| text(a, "url"))
                .collect()
        })
        .unwrap_or_default()
}
