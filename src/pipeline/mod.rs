use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, PipelineError};
use crate::model::{
    DocumentSegment, GroundTruthBundle, ProcessReport, RawSegment, ResultNotification,
    SegmentFieldScore, SplittingScore, TaskStatus,
};
use crate::request::{ValidatedRequest, sanitize_reference_for_logging};
use crate::scoring;
use crate::segment::{inferred_total_pages, unclassified_gap_pages, validate_segments};
use crate::util::{now_utc_string, sha256_hex};

pub mod ledger;
pub mod retry;

pub use ledger::TaskLedger;

/// The document-understanding model call, treated as an opaque function.
/// Implementations must fail closed: timeouts, malformed responses, and
/// transport failures surface as `CollaboratorError`, never partial data.
pub trait Segmenter {
    fn segment(
        &self,
        pdf: &[u8],
        max_documents: usize,
    ) -> Result<Vec<RawSegment>, CollaboratorError>;
}

/// Blob storage collaborator. Failures are transient by contract unless
/// the implementation marks them permanent (e.g. not-found).
pub trait BlobStore {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, CollaboratorError>;
    fn store(&self, name: &str, bytes: &[u8]) -> Result<String, CollaboratorError>;
}

/// Ground-truth lookup. `Ok(None)` means no ground truth exists for the
/// task, which skips scoring and is not an error.
pub trait GroundTruthSource {
    fn load(&self, correlation_key: &str) -> Result<Option<GroundTruthBundle>, CollaboratorError>;
}

/// Outward notification transport.
pub trait Notifier {
    fn deliver(&self, notification: &ResultNotification) -> Result<(), CollaboratorError>;
}

/// What a single delivery attempt produced.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Completed { results_reference: String },
    /// The task already succeeded and its notification already went out;
    /// this delivery is a duplicate and must have no outward effect.
    AlreadySucceeded,
}

/// Drives one task through validate, segment, check, score, package, and
/// deliver. Collaborators are injected by the process entry point; the
/// pipeline holds no global state and stages always execute in this fixed
/// order.
pub struct TaskPipeline<'a> {
    pub(crate) config: &'a PipelineConfig,
    pub(crate) segmenter: &'a dyn Segmenter,
    pub(crate) store: &'a dyn BlobStore,
    pub(crate) ground_truth: &'a dyn GroundTruthSource,
    pub(crate) notifier: &'a dyn Notifier,
    pub(crate) ledger: &'a TaskLedger,
}

impl<'a> TaskPipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        segmenter: &'a dyn Segmenter,
        store: &'a dyn BlobStore,
        ground_truth: &'a dyn GroundTruthSource,
        notifier: &'a dyn Notifier,
        ledger: &'a TaskLedger,
    ) -> Self {
        Self {
            config,
            segmenter,
            store,
            ground_truth,
            notifier,
            ledger,
        }
    }

    /// Execute one delivery attempt. Errors carry their severity; the
    /// retry layer decides what each severity means for the lifecycle.
    /// Success is only returned after the result is durably stored and
    /// the success notification is sent; anything partial is a failure of
    /// the whole attempt.
    pub fn run_attempt(&self, message_body: &[u8]) -> Result<AttemptOutcome, PipelineError> {
        self.config.validate()?;

        let request = ValidatedRequest::from_message(message_body)?;
        let key = request.correlation_key.as_str();

        // Delivery is at-least-once: a task that already succeeded may
        // come back. Re-sending is only allowed when the success
        // notification never went out.
        if let Some(row) = self.ledger.task(key)? {
            if row.status == TaskStatus::Succeeded {
                if row.success_notified {
                    info!(correlation_key = key, "duplicate delivery of succeeded task, skipping");
                    return Ok(AttemptOutcome::AlreadySucceeded);
                }
                if let Some(reference) = row.results_reference {
                    self.notify_success(key, &reference)?;
                    return Ok(AttemptOutcome::Completed {
                        results_reference: reference,
                    });
                }
            }
        }

        let attempt = self.ledger.begin_attempt(key)?;
        info!(
            correlation_key = key,
            attempt,
            pdf = %sanitize_reference_for_logging(&request.pdf_reference),
            "attempt started"
        );

        let pdf = self.store.fetch(&request.pdf_reference)?;
        if pdf.is_empty() {
            return Err(PipelineError::Validation("pdf is empty".into()));
        }
        if pdf.len() as u64 > self.config.max_pdf_bytes {
            return Err(PipelineError::Validation(format!(
                "pdf too large: {} bytes (max {})",
                pdf.len(),
                self.config.max_pdf_bytes
            )));
        }
        let pdf_sha256 = sha256_hex(&pdf);
        info!(correlation_key = key, bytes = pdf.len(), sha256 = %pdf_sha256, "pdf fetched");

        let raw_segments = self
            .segmenter
            .segment(&pdf, self.config.max_output_documents)?;
        if raw_segments.len() > self.config.max_output_documents {
            return Err(PipelineError::Validation(format!(
                "model reported {} documents (max {})",
                raw_segments.len(),
                self.config.max_output_documents
            )));
        }

        let total_pages = self.resolve_total_pages(&request, &raw_segments)?;
        let segments = validate_segments(&raw_segments, total_pages)?;
        info!(
            correlation_key = key,
            segments = segments.len(),
            total_pages,
            "segmentation validated"
        );

        let gap_pages = unclassified_gap_pages(&segments, total_pages);
        if !gap_pages.is_empty() {
            warn!(
                correlation_key = key,
                gap_pages = gap_pages.len(),
                "pages not claimed by any segment"
            );
        }

        let (splitting_score, field_scores) = match self.ground_truth.load(key)? {
            Some(bundle) => {
                let splitting = scoring::splitting::score(&segments, &bundle.segments);
                info!(
                    correlation_key = key,
                    overall_score = splitting.overall_score,
                    type_accuracy = splitting.type_accuracy,
                    "splitting scored against ground truth"
                );
                let fields = score_segment_fields(&segments, &bundle);
                (Some(splitting), fields)
            }
            None => {
                info!(correlation_key = key, "no ground truth available, skipping scoring");
                (None, Vec::new())
            }
        };

        let report = ProcessReport {
            correlation_key: key.to_string(),
            pdf_sha256,
            total_pages,
            gap_page_count: gap_pages.len(),
            segments,
            splitting_score,
            field_scores,
            generated_at: now_utc_string(),
        };
        let payload = serde_json::to_vec_pretty(&report)
            .map_err(|err| PipelineError::Internal(format!("failed to serialize report: {err}")))?;

        let results_reference = self.store.store(&format!("{key}_results.json"), &payload)?;
        info!(
            correlation_key = key,
            results = %sanitize_reference_for_logging(&results_reference),
            "results stored"
        );

        self.ledger.record_success(key, &results_reference)?;
        self.notify_success(key, &results_reference)?;

        Ok(AttemptOutcome::Completed { results_reference })
    }

    fn resolve_total_pages(
        &self,
        request: &ValidatedRequest,
        raw_segments: &[RawSegment],
    ) -> Result<u32, PipelineError> {
        let total_pages = request
            .total_pages
            .unwrap_or_else(|| inferred_total_pages(raw_segments));
        if total_pages > self.config.max_pages {
            return Err(PipelineError::Validation(format!(
                "task claims {total_pages} pages (max {})",
                self.config.max_pages
            )));
        }
        Ok(total_pages)
    }

    /// Send the success notification at most once. The claim is taken
    /// before delivery and released if delivery fails, so a later attempt
    /// can retry the send without ever producing two notifications in a
    /// sequential redelivery stream.
    fn notify_success(&self, key: &str, results_reference: &str) -> Result<(), PipelineError> {
        if !self.ledger.claim_success_notification(key)? {
            return Ok(());
        }

        let notification = ResultNotification::success(key, results_reference);
        if let Err(err) = self.notifier.deliver(&notification) {
            self.ledger.release_success_notification(key)?;
            return Err(err.into());
        }
        info!(correlation_key = key, "success notification sent");
        Ok(())
    }
}

/// Score extracted fields for every segment whose page range has a
/// ground-truth field map. Segments without one are not scored, matching
/// the ground-truth-driven iteration rule.
pub(crate) fn score_segment_fields(
    segments: &[DocumentSegment],
    bundle: &GroundTruthBundle,
) -> Vec<SegmentFieldScore> {
    segments
        .iter()
        .filter_map(|segment| {
            bundle
                .fields_by_range
                .get(&segment.page_range())
                .map(|truth| SegmentFieldScore {
                    page_range: segment.page_range(),
                    kind: segment.kind,
                    score: scoring::fields::score(&segment.fields, truth),
                })
        })
        .collect()
}

/// One-line operational summary of a splitting score.
pub fn splitting_summary(score: &SplittingScore) -> String {
    format!(
        "predicted={} truth={} count_match={} type={:.1}% pages={:.1}% overall={:.1}%",
        score.predicted_count,
        score.ground_truth_count,
        score.count_match,
        score.type_accuracy,
        score.page_numbers_accuracy,
        score.overall_score
    )
}
