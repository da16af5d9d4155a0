use tracing::{error, info, warn};

use crate::error::Severity;
use crate::model::{ResultNotification, TaskStatus};
use crate::request::sanitize_error_message;

use super::{AttemptOutcome, TaskPipeline};

/// Bounded-retry policy. Attempts beyond the budget are handed to the
/// poison path, never retried again.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Terminal state of one driven task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDisposition {
    Succeeded { results_reference: String },
    AlreadySucceeded,
    Abandoned { severity: Severity, message: String },
}

/// Drive a task to a terminal state, replaying transient failures up to
/// the retry budget. This loop stands in for the transport's at-least-once
/// redelivery; the state transitions and notification rules are exactly
/// those a queue-triggered invocation follows per delivery:
///
/// - Permanent and Critical failures notify immediately, exactly once,
///   and abandon the task.
/// - Transient failures never notify; the task returns to Pending and is
///   redelivered until the budget runs out, at which point the poison
///   handler emits the single failure notification.
///
/// Never returns an error: every outcome, including poison, resolves to a
/// disposition so the caller cannot accidentally re-raise into a
/// reprocessing loop.
pub fn drive(pipeline: &TaskPipeline<'_>, policy: &RetryPolicy, message_body: &[u8]) -> TaskDisposition {
    let correlation_key = lenient_correlation_key(message_body);
    let max_attempts = policy.max_attempts.max(1);

    let mut last_transient: Option<String> = None;

    for attempt in 1..=max_attempts {
        match pipeline.run_attempt(message_body) {
            Ok(AttemptOutcome::Completed { results_reference }) => {
                info!(correlation_key = %correlation_key, attempt, "task succeeded");
                return TaskDisposition::Succeeded { results_reference };
            }
            Ok(AttemptOutcome::AlreadySucceeded) => {
                return TaskDisposition::AlreadySucceeded;
            }
            Err(err) => {
                let severity = err.severity();
                let message = sanitize_error_message(&err.to_string());

                match severity {
                    Severity::Permanent | Severity::Critical => {
                        let status = if severity == Severity::Critical {
                            error!(correlation_key = %correlation_key, error = %message, "critical failure");
                            TaskStatus::FailedCritical
                        } else {
                            error!(correlation_key = %correlation_key, error = %message, "permanent failure");
                            TaskStatus::FailedPermanent
                        };
                        record_error_best_effort(pipeline, &correlation_key, status, &message);
                        notify_failure_once(pipeline, &correlation_key, &message);
                        record_status_best_effort(pipeline, &correlation_key, TaskStatus::Abandoned);
                        return TaskDisposition::Abandoned { severity, message };
                    }
                    Severity::Transient => {
                        // Transient attempts never notify; only the poison
                        // handler may, after the budget is spent.
                        warn!(
                            correlation_key = %correlation_key,
                            attempt,
                            max_attempts,
                            error = %message,
                            "transient failure"
                        );
                        record_error_best_effort(
                            pipeline,
                            &correlation_key,
                            TaskStatus::FailedTransient,
                            &message,
                        );
                        last_transient = Some(message);
                        if attempt < max_attempts {
                            record_status_best_effort(
                                pipeline,
                                &correlation_key,
                                TaskStatus::Pending,
                            );
                        }
                    }
                }
            }
        }
    }

    handle_poison(pipeline, &correlation_key, last_transient)
}

/// Terminal handler for a task that exhausted its retry budget. Emits
/// exactly one failure notification, reusing the last recorded error
/// context when available, and never re-raises.
fn handle_poison(
    pipeline: &TaskPipeline<'_>,
    correlation_key: &str,
    last_error: Option<String>,
) -> TaskDisposition {
    let message = last_error
        .or_else(|| {
            pipeline
                .ledger
                .task(correlation_key)
                .ok()
                .flatten()
                .and_then(|row| row.last_error)
        })
        .unwrap_or_else(|| "task abandoned after exhausting retry attempts".to_string());

    error!(correlation_key = %correlation_key, error = %message, "retry budget exhausted, poisoning task");

    notify_failure_once(pipeline, correlation_key, &message);
    record_status_best_effort(pipeline, correlation_key, TaskStatus::Abandoned);

    TaskDisposition::Abandoned {
        severity: Severity::Transient,
        message,
    }
}

/// Deliver the failure notification unless one already went out for this
/// task. Delivery trouble is logged and swallowed: the failure path must
/// not itself fail.
fn notify_failure_once(pipeline: &TaskPipeline<'_>, correlation_key: &str, message: &str) {
    match pipeline.ledger.claim_failure_notification(correlation_key) {
        Ok(true) => {
            let notification = ResultNotification::failure(correlation_key, message);
            if let Err(err) = pipeline.notifier.deliver(&notification) {
                error!(
                    correlation_key = %correlation_key,
                    error = %err,
                    "failed to deliver failure notification"
                );
            } else {
                info!(correlation_key = %correlation_key, "failure notification sent");
            }
        }
        Ok(false) => {
            info!(
                correlation_key = %correlation_key,
                "failure notification already sent, suppressing duplicate"
            );
        }
        Err(err) => {
            error!(correlation_key = %correlation_key, error = %err, "ledger unavailable for notification claim");
        }
    }
}

fn record_error_best_effort(
    pipeline: &TaskPipeline<'_>,
    correlation_key: &str,
    status: TaskStatus,
    message: &str,
) {
    if let Err(err) = pipeline.ledger.record_error(correlation_key, status, message) {
        warn!(correlation_key = %correlation_key, error = %err, "failed to record error in ledger");
    }
}

fn record_status_best_effort(
    pipeline: &TaskPipeline<'_>,
    correlation_key: &str,
    status: TaskStatus,
) {
    if let Err(err) = pipeline.ledger.record_status(correlation_key, status) {
        warn!(correlation_key = %correlation_key, error = %err, "failed to record status in ledger");
    }
}

/// Best-effort correlation key for notifications when the message never
/// passed validation. A task whose body cannot even be parsed still gets
/// a failure notification, keyed UNKNOWN.
fn lenient_correlation_key(message_body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(message_body)
        .ok()
        .and_then(|value| {
            value
                .get("correlationKey")
                .or_else(|| value.get("correlation_key"))
                .and_then(|key| key.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::CollaboratorError;
    use crate::model::{DocumentKind, GroundTruthBundle, GroundTruthSegment, RawSegment};
    use crate::pipeline::{
        BlobStore, GroundTruthSource, Notifier, Segmenter, TaskLedger, TaskPipeline,
    };

    fn raw_segment(doc_type: &str, start: i64, end: i64) -> RawSegment {
        RawSegment {
            doc_type: Some(doc_type.to_string()),
            start_page: Some(start),
            end_page: Some(end),
            confidence: Some(0.9),
            fields: BTreeMap::new(),
        }
    }

    /// Segmenter that replays a scripted sequence of responses, one per
    /// attempt, then repeats the final entry.
    struct ScriptedSegmenter {
        script: RefCell<VecDeque<Result<Vec<RawSegment>, CollaboratorError>>>,
        fallback: Result<Vec<RawSegment>, CollaboratorError>,
    }

    impl ScriptedSegmenter {
        fn new(script: Vec<Result<Vec<RawSegment>, CollaboratorError>>) -> Self {
            let fallback = script
                .last()
                .cloned()
                .unwrap_or_else(|| Err(CollaboratorError::transient("script empty")));
            Self {
                script: RefCell::new(script.into()),
                fallback,
            }
        }
    }

    impl Segmenter for ScriptedSegmenter {
        fn segment(
            &self,
            _pdf: &[u8],
            _max_documents: usize,
        ) -> Result<Vec<RawSegment>, CollaboratorError> {
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    struct MemoryStore {
        stored: RefCell<Vec<String>>,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                stored: RefCell::new(Vec::new()),
            }
        }
    }

    impl BlobStore for MemoryStore {
        fn fetch(&self, reference: &str) -> Result<Vec<u8>, CollaboratorError> {
            if reference == "missing.pdf" {
                return Err(CollaboratorError::permanent("blob not found"));
            }
            Ok(b"%PDF-1.7 test bytes".to_vec())
        }

        fn store(&self, name: &str, _bytes: &[u8]) -> Result<String, CollaboratorError> {
            let reference = format!("results/{name}");
            self.stored.borrow_mut().push(reference.clone());
            Ok(reference)
        }
    }

    struct NoGroundTruth;

    impl GroundTruthSource for NoGroundTruth {
        fn load(
            &self,
            _correlation_key: &str,
        ) -> Result<Option<GroundTruthBundle>, CollaboratorError> {
            Ok(None)
        }
    }

    struct FixtureGroundTruth(GroundTruthBundle);

    impl GroundTruthSource for FixtureGroundTruth {
        fn load(
            &self,
            _correlation_key: &str,
        ) -> Result<Option<GroundTruthBundle>, CollaboratorError> {
            Ok(Some(self.0.clone()))
        }
    }

    struct MemoryNotifier {
        sent: RefCell<Vec<ResultNotification>>,
    }

    impl MemoryNotifier {
        fn new() -> Self {
            Self {
                sent: RefCell::new(Vec::new()),
            }
        }

        fn successes(&self) -> usize {
            self.sent
                .borrow()
                .iter()
                .filter(|n| n.status == "success")
                .count()
        }

        fn failures(&self) -> usize {
            self.sent
                .borrow()
                .iter()
                .filter(|n| n.status == "failure")
                .count()
        }
    }

    impl Notifier for MemoryNotifier {
        fn deliver(&self, notification: &ResultNotification) -> Result<(), CollaboratorError> {
            self.sent.borrow_mut().push(notification.clone());
            Ok(())
        }
    }

    fn message(key: &str) -> Vec<u8> {
        json!({ "correlationKey": key, "pdfBlobUrl": "input/combined.pdf", "totalPages": 3 })
            .to_string()
            .into_bytes()
    }

    fn good_segments() -> Vec<RawSegment> {
        vec![
            raw_segment("Invoice", 1, 2),
            raw_segment("Packing List", 3, 3),
        ]
    }

    #[test]
    fn transient_failures_then_success_notifies_success_exactly_once() {
        let config = PipelineConfig::default();
        let segmenter = ScriptedSegmenter::new(vec![
            Err(CollaboratorError::transient("model timeout")),
            Err(CollaboratorError::transient("model timeout")),
            Ok(good_segments()),
        ]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let disposition = drive(&pipeline, &RetryPolicy { max_attempts: 3 }, &message("task-1"));

        assert!(matches!(disposition, TaskDisposition::Succeeded { .. }));
        assert_eq!(notifier.successes(), 1);
        assert_eq!(notifier.failures(), 0);

        let row = ledger.task("task-1").unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Succeeded);
        assert_eq!(row.attempts, 3);
    }

    #[test]
    fn exhausted_transient_failures_notify_failure_exactly_once_via_poison() {
        let config = PipelineConfig::default();
        let segmenter =
            ScriptedSegmenter::new(vec![Err(CollaboratorError::transient("model timeout"))]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let disposition = drive(&pipeline, &RetryPolicy { max_attempts: 3 }, &message("task-2"));

        assert!(matches!(
            disposition,
            TaskDisposition::Abandoned {
                severity: Severity::Transient,
                ..
            }
        ));
        assert_eq!(notifier.successes(), 0);
        assert_eq!(notifier.failures(), 1);

        let row = ledger.task("task-2").unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Abandoned);
        assert_eq!(row.attempts, 3);
        assert!(row.last_error.unwrap().contains("model timeout"));
    }

    #[test]
    fn permanent_failure_notifies_immediately_without_retry() {
        let config = PipelineConfig::default();
        // Overlapping output: a segmentation invariant violation.
        let segmenter = ScriptedSegmenter::new(vec![Ok(vec![
            raw_segment("Invoice", 1, 2),
            raw_segment("OBL", 2, 3),
        ])]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let disposition = drive(&pipeline, &RetryPolicy { max_attempts: 3 }, &message("task-3"));

        assert!(matches!(
            disposition,
            TaskDisposition::Abandoned {
                severity: Severity::Permanent,
                ..
            }
        ));
        assert_eq!(notifier.failures(), 1);

        let row = ledger.task("task-3").unwrap().unwrap();
        // Exactly one attempt: permanent failures never retry.
        assert_eq!(row.attempts, 1);
        assert_eq!(row.status, TaskStatus::Abandoned);
    }

    #[test]
    fn malformed_message_notifies_failure_with_unknown_key() {
        let config = PipelineConfig::default();
        let segmenter = ScriptedSegmenter::new(vec![Ok(good_segments())]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let disposition = drive(&pipeline, &RetryPolicy::default(), b"not json at all");

        assert!(matches!(
            disposition,
            TaskDisposition::Abandoned {
                severity: Severity::Permanent,
                ..
            }
        ));
        let sent = notifier.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].correlation_key, "UNKNOWN");
        assert_eq!(sent[0].status, "failure");
    }

    #[test]
    fn critical_configuration_error_abandons_without_retry() {
        let config = PipelineConfig {
            max_output_documents: 0,
            ..PipelineConfig::default()
        };
        let segmenter = ScriptedSegmenter::new(vec![Ok(good_segments())]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let disposition = drive(&pipeline, &RetryPolicy::default(), &message("task-4"));

        assert!(matches!(
            disposition,
            TaskDisposition::Abandoned {
                severity: Severity::Critical,
                ..
            }
        ));
        assert_eq!(notifier.failures(), 1);
    }

    #[test]
    fn redelivery_of_succeeded_task_sends_no_second_success() {
        let config = PipelineConfig::default();
        let segmenter = ScriptedSegmenter::new(vec![Ok(good_segments())]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let first = drive(&pipeline, &RetryPolicy::default(), &message("task-5"));
        assert!(matches!(first, TaskDisposition::Succeeded { .. }));

        let second = drive(&pipeline, &RetryPolicy::default(), &message("task-5"));
        assert_eq!(second, TaskDisposition::AlreadySucceeded);
        assert_eq!(notifier.successes(), 1);
    }

    #[test]
    fn permanent_storage_failure_is_not_retried() {
        let config = PipelineConfig::default();
        let segmenter = ScriptedSegmenter::new(vec![Ok(good_segments())]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &NoGroundTruth, &notifier, &ledger);

        let body =
            json!({ "correlationKey": "task-6", "pdfBlobUrl": "missing.pdf" }).to_string();
        let disposition = drive(&pipeline, &RetryPolicy::default(), body.as_bytes());

        assert!(matches!(
            disposition,
            TaskDisposition::Abandoned {
                severity: Severity::Permanent,
                ..
            }
        ));
        assert_eq!(ledger.task("task-6").unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn ground_truth_scoring_lands_in_the_stored_report() {
        let config = PipelineConfig::default();
        let segmenter = ScriptedSegmenter::new(vec![Ok(good_segments())]);
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let ledger = TaskLedger::open_in_memory().unwrap();
        let bundle = GroundTruthBundle {
            segments: vec![
                GroundTruthSegment {
                    kind: DocumentKind::from_code("FSI"),
                    doc_type_code: "FSI".into(),
                    filing_name: "Supplier Invoice".into(),
                    pages: vec![1, 2],
                },
                GroundTruthSegment {
                    kind: DocumentKind::from_code("FPL"),
                    doc_type_code: "FPL".into(),
                    filing_name: "Packing List".into(),
                    pages: vec![3],
                },
            ],
            fields_by_range: BTreeMap::new(),
        };
        let ground_truth = FixtureGroundTruth(bundle);
        let pipeline =
            TaskPipeline::new(&config, &segmenter, &store, &ground_truth, &notifier, &ledger);

        let disposition = drive(&pipeline, &RetryPolicy::default(), &message("task-7"));
        assert!(matches!(disposition, TaskDisposition::Succeeded { .. }));
        assert_eq!(store.stored.borrow().len(), 1);
    }
}
