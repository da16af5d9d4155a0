use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of document kinds the segmentation model may emit. `Unknown`
/// is a legitimate classification, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    Invoice,
    #[serde(rename = "Packing List")]
    PackingList,
    #[serde(rename = "OBL")]
    Obl,
    #[serde(rename = "HAWB")]
    Hawb,
    Unknown,
}

impl DocumentKind {
    /// Resolve a raw model/fixture tag. Accepts the serialized names plus
    /// the short forms the model has been observed to emit.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "Invoice" | "INVOICE" => Some(Self::Invoice),
            "Packing List" | "PackingList" | "PACKING_LIST" => Some(Self::PackingList),
            "OBL" => Some(Self::Obl),
            "HAWB" => Some(Self::Hawb),
            "Unknown" | "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Filing-system short codes used by ground-truth fixtures. `FWA`
    /// (generic waybill) maps to HAWB as the closest supported kind.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "FSI" => Some(Self::Invoice),
            "FPL" => Some(Self::PackingList),
            "OBL" => Some(Self::Obl),
            "HAWB" | "FWA" => Some(Self::Hawb),
            _ => None,
        }
    }

    /// Human-readable filing names used by ground-truth fixtures.
    pub fn from_filing_name(name: &str) -> Option<Self> {
        match name.trim() {
            "Supplier Invoice" => Some(Self::Invoice),
            "Packing List" => Some(Self::PackingList),
            "Ocean Bill of Lading" => Some(Self::Obl),
            "House Air Waybill" | "Waybill" => Some(Self::Hawb),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invoice => "Invoice",
            Self::PackingList => "Packing List",
            Self::Obl => "OBL",
            Self::Hawb => "HAWB",
            Self::Unknown => "Unknown",
        }
    }
}

/// Unvalidated segment descriptor exactly as the model returns it. Every
/// field is optional because the model may omit or mangle any of them;
/// `validate_segments` is where these become trustworthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSegment {
    #[serde(rename = "DOC_TYPE")]
    pub doc_type: Option<String>,
    #[serde(rename = "START_PAGE_NO")]
    pub start_page: Option<i64>,
    #[serde(rename = "END_PAGE_NO")]
    pub end_page: Option<i64>,
    #[serde(rename = "CONFIDENCE")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// One detected sub-document with verified invariants. Immutable once
/// constructed; downstream consumers may assume the page range is in
/// bounds and disjoint from every other segment of the same task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSegment {
    pub kind: DocumentKind,
    pub kind_confidence: f64,
    pub start_page: u32,
    pub end_page: u32,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl DocumentSegment {
    pub fn page_count(&self) -> u32 {
        self.end_page - self.start_page + 1
    }

    pub fn page_numbers(&self) -> Vec<u32> {
        (self.start_page..=self.end_page).collect()
    }

    pub fn page_range(&self) -> String {
        format!("{}-{}", self.start_page, self.end_page)
    }
}

/// Classification of a single page, used when the model emits per-page
/// labels instead of ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageClassification {
    pub page_number: u32,
    pub kind: DocumentKind,
    pub confidence: Option<f64>,
}

/// Ground-truth counterpart of a segment, sourced from a trusted fixture.
/// Pages are an explicit list because XML fixtures enumerate them one by
/// one; the raw code and filing name are kept for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthSegment {
    pub kind: Option<DocumentKind>,
    pub doc_type_code: String,
    pub filing_name: String,
    pub pages: Vec<u32>,
}

impl GroundTruthSegment {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Ground truth for one task: the expected segmentation plus extracted
/// field values keyed by `"start-end"` page-range label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundTruthBundle {
    pub segments: Vec<GroundTruthSegment>,
    #[serde(default)]
    pub fields_by_range: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Pairwise comparison between one predicted segment and its positionally
/// paired ground-truth segment. Either side may be absent when the counts
/// disagree; such entries are reported but never scored.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentMatch {
    pub predicted: Option<DocumentSegment>,
    pub ground_truth: Option<GroundTruthSegment>,
    pub kind_match: bool,
    pub page_count_match: bool,
    pub page_numbers_match: bool,
    pub exact_match: bool,
}

/// Aggregate segmentation accuracy for one task. Deterministic given the
/// two segment lists; recomputation is idempotent.
#[derive(Debug, Clone, Serialize)]
pub struct SplittingScore {
    pub predicted_count: usize,
    pub ground_truth_count: usize,
    pub count_match: bool,
    pub type_accuracy: f64,
    pub page_count_accuracy: f64,
    pub page_numbers_accuracy: f64,
    pub overall_score: f64,
    pub per_document_detail: Vec<SegmentMatch>,
}

/// Comparison record for a single extracted field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldComparison {
    pub extracted: Option<Value>,
    pub ground_truth: Value,
    pub correct: bool,
}

/// Aggregate field-extraction accuracy for one document instance. `score`
/// is `None` (serialized `null`) when the ground truth has no fields,
/// which is distinct from a 0% score.
#[derive(Debug, Clone, Serialize)]
pub struct FieldScore {
    pub total_fields: usize,
    pub correct_fields: usize,
    pub score: Option<f64>,
    pub field_comparison: BTreeMap<String, FieldComparison>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    FailedTransient,
    FailedPermanent,
    FailedCritical,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
            Self::FailedCritical => "failed_critical",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed_transient" => Some(Self::FailedTransient),
            "failed_permanent" => Some(Self::FailedPermanent),
            "failed_critical" => Some(Self::FailedCritical),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// Inbound queue message. Field names follow the upstream wire contract.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskMessage {
    #[serde(rename = "correlationKey", alias = "correlation_key")]
    pub correlation_key: Option<String>,
    #[serde(rename = "pdfBlobUrl", alias = "pdf_blob_url")]
    pub pdf_reference: Option<String>,
    #[serde(rename = "totalPages", alias = "total_pages")]
    pub total_pages: Option<u32>,
}

/// Outward notification. Exactly one of these is emitted per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultNotification {
    #[serde(rename = "correlationKey")]
    pub correlation_key: String,
    pub status: String,
    #[serde(rename = "resultsBlobUrl", skip_serializing_if = "Option::is_none")]
    pub results_reference: Option<String>,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ResultNotification {
    pub fn success(correlation_key: &str, results_reference: &str) -> Self {
        Self {
            correlation_key: correlation_key.to_string(),
            status: "success".to_string(),
            results_reference: Some(results_reference.to_string()),
            error_message: None,
        }
    }

    pub fn failure(correlation_key: &str, error_message: &str) -> Self {
        Self {
            correlation_key: correlation_key.to_string(),
            status: "failure".to_string(),
            results_reference: None,
            error_message: Some(error_message.to_string()),
        }
    }
}

/// Packaged success payload delivered to the results store.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub correlation_key: String,
    pub pdf_sha256: String,
    pub total_pages: u32,
    pub gap_page_count: usize,
    pub segments: Vec<DocumentSegment>,
    pub splitting_score: Option<SplittingScore>,
    pub field_scores: Vec<SegmentFieldScore>,
    pub generated_at: String,
}

/// Field score attributed to one segment's page range.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentFieldScore {
    pub page_range: String,
    pub kind: DocumentKind,
    pub score: FieldScore,
}
