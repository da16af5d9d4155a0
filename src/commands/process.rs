use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

use crate::cli::ProcessArgs;
use crate::config::PipelineConfig;
use crate::error::CollaboratorError;
use crate::grouping;
use crate::model::{
    DocumentSegment, GroundTruthBundle, PageClassification, RawSegment, ResultNotification,
};
use crate::pipeline::retry::{self, RetryPolicy, TaskDisposition};
use crate::pipeline::{BlobStore, GroundTruthSource, Notifier, Segmenter, TaskLedger, TaskPipeline};
use crate::util::ensure_directory;

/// Drive one task message end to end with file-backed collaborators. The
/// local attempt loop stands in for the transport's redelivery; everything
/// downstream of the collaborator traits is the same code a real transport
/// would run.
pub fn run(args: ProcessArgs) -> Result<()> {
    ensure_directory(&args.cache_root)?;

    let config = PipelineConfig {
        max_attempts: args.max_attempts,
        max_output_documents: args.max_output_documents,
        max_pdf_bytes: args.max_pdf_bytes,
        max_pages: args.max_pages,
    };

    let message = fs::read(&args.message_path)
        .with_context(|| format!("failed to read {}", args.message_path.display()))?;

    let results_dir = args.cache_root.join("results");
    ensure_directory(&results_dir)?;

    let store = FileStore {
        input_root: args.input_root.clone(),
        results_dir,
    };
    let segmenter = FileSegmenter {
        path: args.segments_path.clone(),
    };
    let ground_truth = FileGroundTruth {
        path: args.ground_truth_path.clone(),
    };
    let notifier = FileNotifier {
        path: args.cache_root.join("notifications.jsonl"),
    };
    let ledger = TaskLedger::open(&args.cache_root.join("docsplit_ledger.sqlite"))?;

    let pipeline = TaskPipeline::new(&config, &segmenter, &store, &ground_truth, &notifier, &ledger);
    let policy = RetryPolicy {
        max_attempts: config.max_attempts,
    };

    match retry::drive(&pipeline, &policy, &message) {
        TaskDisposition::Succeeded { results_reference } => {
            info!(results = %results_reference, "task completed");
            Ok(())
        }
        TaskDisposition::AlreadySucceeded => {
            info!("task had already completed, nothing to do");
            Ok(())
        }
        TaskDisposition::Abandoned { severity, message } => {
            bail!("task abandoned ({}): {message}", severity.as_str())
        }
    }
}

/// Local-filesystem blob store: references resolve under `input_root`,
/// results land under `results_dir`. A missing input file is permanent,
/// the same class as a dangling blob reference.
struct FileStore {
    input_root: PathBuf,
    results_dir: PathBuf,
}

impl BlobStore for FileStore {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, CollaboratorError> {
        let path = self.input_root.join(reference);
        if !path.exists() {
            return Err(CollaboratorError::permanent(format!(
                "input not found: {}",
                path.display()
            )));
        }
        fs::read(&path).map_err(|err| {
            CollaboratorError::transient(format!("failed to read {}: {err}", path.display()))
        })
    }

    fn store(&self, name: &str, bytes: &[u8]) -> Result<String, CollaboratorError> {
        let path = self.results_dir.join(name);
        fs::write(&path, bytes).map_err(|err| {
            CollaboratorError::transient(format!("failed to write {}: {err}", path.display()))
        })?;
        Ok(path.display().to_string())
    }
}

/// Stand-in for the segmentation model call: reads the raw output the
/// model would have produced for this PDF. Unreadable files look like a
/// flaky model endpoint; unparseable content is the model's fault and
/// retrying cannot help.
///
/// Two layouts are accepted: a JSON array of raw segments (the range
/// format), or `{"pages": [...]}` of per-page classifications, which are
/// grouped into ranges here and cross-checked by the invariant checker
/// downstream like any other model output.
struct FileSegmenter {
    path: PathBuf,
}

impl Segmenter for FileSegmenter {
    fn segment(
        &self,
        _pdf: &[u8],
        _max_documents: usize,
    ) -> Result<Vec<RawSegment>, CollaboratorError> {
        let raw = fs::read(&self.path).map_err(|err| {
            CollaboratorError::transient(format!(
                "failed to read segmentation output {}: {err}",
                self.path.display()
            ))
        })?;
        parse_segmentation_output(&raw).map_err(|err| {
            CollaboratorError::permanent(format!("malformed segmentation output: {err}"))
        })
    }
}

#[derive(Deserialize)]
struct PerPageOutput {
    pages: Vec<PageClassification>,
}

fn parse_segmentation_output(raw: &[u8]) -> serde_json::Result<Vec<RawSegment>> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    if value.is_object() {
        let per_page: PerPageOutput = serde_json::from_value(value)?;
        let segments = grouping::group_consecutive(&per_page.pages);
        return Ok(segments.iter().map(segment_to_raw).collect());
    }
    serde_json::from_value(value)
}

fn segment_to_raw(segment: &DocumentSegment) -> RawSegment {
    RawSegment {
        doc_type: Some(segment.kind.as_str().to_string()),
        start_page: Some(i64::from(segment.start_page)),
        end_page: Some(i64::from(segment.end_page)),
        confidence: Some(segment.kind_confidence),
        fields: Default::default(),
    }
}

struct FileGroundTruth {
    path: Option<PathBuf>,
}

impl GroundTruthSource for FileGroundTruth {
    fn load(&self, _correlation_key: &str) -> Result<Option<GroundTruthBundle>, CollaboratorError> {
        match &self.path {
            None => Ok(None),
            Some(path) => crate::groundtruth::load_fixture(path)
                .map(Some)
                .map_err(|err| CollaboratorError::permanent(err.to_string())),
        }
    }
}

/// Appends each notification as one JSON line, the local stand-in for the
/// outbound queue.
struct FileNotifier {
    path: PathBuf,
}

impl Notifier for FileNotifier {
    fn deliver(&self, notification: &ResultNotification) -> Result<(), CollaboratorError> {
        let line = serde_json::to_string(notification).map_err(|err| {
            CollaboratorError::transient(format!("failed to encode notification: {err}"))
        })?;
        append_line(&self.path, &line).map_err(|err| {
            CollaboratorError::transient(format!(
                "failed to append {}: {err}",
                self.path.display()
            ))
        })
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_reports_missing_input_as_permanent() {
        let store = FileStore {
            input_root: PathBuf::from("/nonexistent"),
            results_dir: PathBuf::from("/nonexistent"),
        };
        let err = store.fetch("no-such.pdf").unwrap_err();
        assert!(err.permanent);
    }

    #[test]
    fn file_ground_truth_without_path_skips_scoring() {
        let source = FileGroundTruth { path: None };
        assert!(source.load("any").unwrap().is_none());
    }

    #[test]
    fn per_page_output_is_grouped_into_ranges() {
        let raw = br#"{
            "pages": [
                { "page_number": 1, "kind": "Invoice", "confidence": 0.9 },
                { "page_number": 2, "kind": "Invoice", "confidence": 0.8 },
                { "page_number": 3, "kind": "Packing List", "confidence": 0.7 }
            ]
        }"#;

        let segments = parse_segmentation_output(raw).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].doc_type.as_deref(), Some("Invoice"));
        assert_eq!(segments[0].start_page, Some(1));
        assert_eq!(segments[0].end_page, Some(2));
        assert_eq!(segments[1].doc_type.as_deref(), Some("Packing List"));
    }

    #[test]
    fn range_array_output_parses_directly() {
        let raw = br#"[{ "DOC_TYPE": "OBL", "START_PAGE_NO": 1, "END_PAGE_NO": 4 }]"#;
        let segments = parse_segmentation_output(raw).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end_page, Some(4));
    }
}
