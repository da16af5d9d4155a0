use crate::error::PipelineError;

/// Operational bounds for one pipeline invocation. Built from CLI
/// arguments by the process entry point and injected into the pipeline;
/// nothing reads configuration from module-level state.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delivery attempts before a task is routed to the poison handler.
    pub max_attempts: u32,
    /// Upper bound on documents the model may report for one PDF.
    pub max_output_documents: usize,
    /// Reject PDFs larger than this before invoking the model.
    pub max_pdf_bytes: u64,
    /// Reject tasks claiming more pages than this.
    pub max_pages: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_output_documents: 50,
            max_pdf_bytes: 500 * 1024 * 1024,
            max_pages: 500,
        }
    }
}

impl PipelineConfig {
    /// A nonsensical bound means the process cannot do useful work at all,
    /// which is Critical: notify and abandon rather than retry.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.max_output_documents == 0 {
            return Err(PipelineError::Configuration(
                "max_output_documents must be at least 1".into(),
            ));
        }
        if self.max_pdf_bytes == 0 {
            return Err(PipelineError::Configuration(
                "max_pdf_bytes must be positive".into(),
            ));
        }
        if self.max_pages == 0 {
            return Err(PipelineError::Configuration(
                "max_pages must be positive".into(),
            ));
        }
        Ok(())
    }
}
