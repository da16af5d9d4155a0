use thiserror::Error;

/// How a failure is allowed to affect the task lifecycle.
///
/// Transient failures are retried silently by redelivery; Permanent and
/// Critical failures notify immediately and abandon the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Transient,
    Permanent,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Critical => "critical",
        }
    }
}

/// Structural invariant violations in raw model output. Always Permanent:
/// retrying the same bad output cannot help.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentationError {
    #[error("segments {first_index} and {second_index} overlap on page {page}")]
    Overlap {
        first_index: usize,
        second_index: usize,
        page: u32,
    },
    #[error("segment {index}: page range {start}-{end} outside 1..={total_pages}")]
    OutOfRange {
        index: usize,
        start: i64,
        end: i64,
        total_pages: u32,
    },
    #[error("segment {index}: unknown document type tag {tag:?}")]
    UnknownType { index: usize, tag: String },
}

/// Failure reported by an external collaborator (model call, storage,
/// notification transport). Transient by default; the collaborator may
/// mark a condition permanent (e.g. blob not found).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub permanent: bool,
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

/// Every way a pipeline attempt can fail, resolved to exactly one severity.
/// Matching on this is how the retry layer decides the next transition, so
/// classification happens here and nowhere downstream.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("invalid task input: {0}")]
    Validation(String),
    #[error("segmentation invariant violated: {0}")]
    Segmentation(#[from] SegmentationError),
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("ledger failure: {0}")]
    Ledger(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation(_) | Self::Segmentation(_) => Severity::Permanent,
            Self::Collaborator(err) => {
                if err.permanent {
                    Severity::Permanent
                } else {
                    Severity::Transient
                }
            }
            Self::Configuration(_) => Severity::Critical,
            // Unclassified and local-persistence trouble default to
            // Transient: safer to retry than to silently drop.
            Self::Ledger(_) | Self::Internal(_) => Severity::Transient,
        }
    }
}
