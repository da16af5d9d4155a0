use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use crate::model::{DocumentKind, GroundTruthBundle, GroundTruthSegment};

/// Load a ground-truth fixture by file extension: `SplittedResult` XML for
/// segmentation-only truth, JSON for segmentation plus field values.
pub fn load_fixture(path: &Path) -> Result<GroundTruthBundle> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read ground truth: {}", path.display()))?;

    match extension.as_str() {
        "xml" => parse_splitted_result_xml(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        "json" => parse_json_fixture(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        other => bail!("unsupported ground truth format: {other:?}"),
    }
}

/// Parse a `SplittedResult` XML document: `SplittedDocs/SplitDoc` entries
/// carrying a filing code, filing name, and an explicit page list. Page
/// entries with non-numeric `PageNum` are skipped, matching the upstream
/// parser. XML fixtures carry no field-level ground truth.
pub fn parse_splitted_result_xml(xml: &str) -> Result<GroundTruthBundle> {
    let document = roxmltree::Document::parse(xml).context("malformed XML")?;
    let root = document.root_element();

    let mut segments = Vec::new();
    if let Some(splitted_docs) = child_element(root, "SplittedDocs") {
        for split_doc in splitted_docs
            .children()
            .filter(|node| node.has_tag_name("SplitDoc"))
        {
            let doc_type_code = child_text(split_doc, "FilingDocTypeCode")
                .or_else(|| child_text(split_doc, "DocType"))
                .unwrap_or_default();
            let filing_name = child_text(split_doc, "FilingDocTypeName").unwrap_or_default();

            let mut pages = Vec::new();
            if let Some(pages_node) = child_element(split_doc, "Pages") {
                for page in pages_node.children().filter(|node| node.has_tag_name("Page")) {
                    if let Some(number) = child_text(page, "PageNum")
                        .and_then(|text| text.trim().parse::<u32>().ok())
                    {
                        pages.push(number);
                    }
                }
            }

            let kind = DocumentKind::from_filing_name(&filing_name)
                .or_else(|| DocumentKind::from_code(&doc_type_code));

            segments.push(GroundTruthSegment {
                kind,
                doc_type_code,
                filing_name,
                pages,
            });
        }
    }

    Ok(GroundTruthBundle {
        segments,
        fields_by_range: BTreeMap::new(),
    })
}

#[derive(Debug, Deserialize)]
struct JsonFixture {
    #[serde(default)]
    segments: Vec<JsonFixtureSegment>,
    #[serde(default)]
    fields_by_range: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct JsonFixtureSegment {
    #[serde(default)]
    doc_type_code: String,
    #[serde(default)]
    filing_name: String,
    #[serde(default)]
    pages: Vec<u32>,
}

/// Parse a JSON fixture. Field maps may arrive wrapped in a legacy `OCC`
/// envelope object, which is unwrapped transparently.
pub fn parse_json_fixture(json: &str) -> Result<GroundTruthBundle> {
    let fixture: JsonFixture = serde_json::from_str(json).context("malformed JSON")?;

    let segments = fixture
        .segments
        .into_iter()
        .map(|segment| {
            let kind = DocumentKind::from_filing_name(&segment.filing_name)
                .or_else(|| DocumentKind::from_code(&segment.doc_type_code));
            GroundTruthSegment {
                kind,
                doc_type_code: segment.doc_type_code,
                filing_name: segment.filing_name,
                pages: segment.pages,
            }
        })
        .collect();

    let mut fields_by_range = BTreeMap::new();
    for (range, value) in fixture.fields_by_range {
        fields_by_range.insert(range, unwrap_field_map(value)?);
    }

    Ok(GroundTruthBundle {
        segments,
        fields_by_range,
    })
}

fn unwrap_field_map(value: Value) -> Result<BTreeMap<String, Value>> {
    let object = match value {
        Value::Object(map) => {
            // Legacy fixtures nest the real fields under "OCC".
            match map.get("OCC") {
                Some(Value::Object(inner)) if map.len() == 1 => inner.clone(),
                _ => map,
            }
        }
        other => bail!("field map must be a JSON object, got {other}"),
    };

    Ok(object.into_iter().collect())
}

fn child_element<'a>(
    node: roxmltree::Node<'a, 'a>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'a>> {
    node.children().find(|child| child.has_tag_name(name))
}

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    child_element(node, name).and_then(|child| child.text().map(str::to_string))
}
