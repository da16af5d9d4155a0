use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "docsplit",
    version,
    about = "Segmentation validation, scoring, and reliable task delivery for multi-document PDFs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Process(ProcessArgs),
    Validate(ValidateArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    #[arg(long, default_value = ".cache/docsplit")]
    pub cache_root: PathBuf,

    /// JSON task message (correlationKey, pdfBlobUrl, optional totalPages).
    #[arg(long)]
    pub message_path: PathBuf,

    /// Raw segmentation output for the task's PDF, standing in for the
    /// model call.
    #[arg(long)]
    pub segments_path: PathBuf,

    /// Directory PDF references in the message resolve against.
    #[arg(long, default_value = ".")]
    pub input_root: PathBuf,

    /// Optional ground-truth fixture (SplittedResult XML or JSON).
    #[arg(long)]
    pub ground_truth_path: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 50)]
    pub max_output_documents: usize,

    #[arg(long, default_value_t = 500 * 1024 * 1024)]
    pub max_pdf_bytes: u64,

    #[arg(long, default_value_t = 500)]
    pub max_pages: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long, default_value = ".cache/docsplit")]
    pub cache_root: PathBuf,

    /// Directory of prediction files (raw-segments JSON, one per sample).
    #[arg(long)]
    pub predictions_dir: PathBuf,

    /// Directory of ground-truth fixtures matched to predictions by file
    /// stem (XML or JSON).
    #[arg(long)]
    pub ground_truth_dir: PathBuf,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/docsplit")]
    pub cache_root: PathBuf,

    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}
