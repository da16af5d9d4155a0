use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::ValidateArgs;
use crate::groundtruth::load_fixture;
use crate::model::{RawSegment, SegmentFieldScore, SplittingScore};
use crate::pipeline::{score_segment_fields, splitting_summary};
use crate::scoring;
use crate::segment::{inferred_total_pages, validate_segments};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

/// Offline scoring: every prediction file in `predictions_dir` is checked
/// and scored against the ground-truth fixture sharing its file stem, and
/// the per-sample results plus batch averages land in a timestamped report.
pub fn run(args: ValidateArgs) -> Result<()> {
    let mut prediction_paths = discover_predictions(&args.predictions_dir)?;
    prediction_paths.sort();

    if prediction_paths.is_empty() {
        bail!("no prediction files in {}", args.predictions_dir.display());
    }

    let mut samples = Vec::with_capacity(prediction_paths.len());
    for path in &prediction_paths {
        let sample = evaluate_sample(path, &args.ground_truth_dir);
        match (&sample.error, &sample.splitting) {
            (Some(error), _) => {
                warn!(sample = %sample.name, error = %error, "sample not scored");
            }
            (None, Some(splitting)) => {
                info!(sample = %sample.name, summary = %splitting_summary(splitting), "sample scored");
            }
            (None, None) => {}
        }
        samples.push(sample);
    }

    let summary = summarize(&samples);
    info!(
        samples = summary.total_samples,
        scored = summary.scored_samples,
        failed = summary.failed_samples,
        count_matches = summary.count_matches,
        average_overall = summary.average_overall_score,
        "validation complete"
    );

    let report = ValidationReport {
        generated_at: now_utc_string(),
        summary,
        samples,
    };
    let report_path = args.report_path.unwrap_or_else(|| {
        args.cache_root
            .join("reports")
            .join(format!("validation_{}.json", utc_compact_string(Utc::now())))
    });
    write_json_pretty(&report_path, &report)?;
    info!(path = %report_path.display(), "wrote validation report");

    Ok(())
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    generated_at: String,
    summary: BatchSummary,
    samples: Vec<SampleReport>,
}

#[derive(Debug, Serialize)]
struct SampleReport {
    name: String,
    ground_truth_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    splitting: Option<SplittingScore>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    field_scores: Vec<SegmentFieldScore>,
}

#[derive(Debug, Serialize)]
struct BatchSummary {
    total_samples: usize,
    scored_samples: usize,
    failed_samples: usize,
    count_matches: usize,
    average_overall_score: f64,
    average_type_accuracy: f64,
    average_page_numbers_accuracy: f64,
}

fn evaluate_sample(prediction_path: &Path, ground_truth_dir: &Path) -> SampleReport {
    let name = prediction_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string();

    let mut report = SampleReport {
        name: name.clone(),
        ground_truth_file: None,
        error: None,
        splitting: None,
        field_scores: Vec::new(),
    };

    let Some(truth_path) = find_ground_truth(&name, ground_truth_dir) else {
        report.error = Some("no matching ground-truth fixture".to_string());
        return report;
    };
    report.ground_truth_file = Some(truth_path.display().to_string());

    let raw_segments = match load_predictions(prediction_path) {
        Ok(segments) => segments,
        Err(err) => {
            report.error = Some(err.to_string());
            return report;
        }
    };

    let total_pages = inferred_total_pages(&raw_segments);
    let segments = match validate_segments(&raw_segments, total_pages) {
        Ok(segments) => segments,
        Err(err) => {
            report.error = Some(err.to_string());
            return report;
        }
    };

    let bundle = match load_fixture(&truth_path) {
        Ok(bundle) => bundle,
        Err(err) => {
            report.error = Some(err.to_string());
            return report;
        }
    };

    report.splitting = Some(scoring::splitting::score(&segments, &bundle.segments));
    report.field_scores = score_segment_fields(&segments, &bundle);
    report
}

fn load_predictions(path: &Path) -> Result<Vec<RawSegment>> {
    let raw =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn discover_predictions(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json && path.is_file() {
            paths.push(path);
        }
    }

    Ok(paths)
}

/// Ground-truth fixtures are matched by file stem; XML wins when both
/// formats exist for one sample.
fn find_ground_truth(stem: &str, dir: &Path) -> Option<PathBuf> {
    for extension in ["xml", "json"] {
        let candidate = dir.join(format!("{stem}.{extension}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn summarize(samples: &[SampleReport]) -> BatchSummary {
    let scored: Vec<&SplittingScore> = samples
        .iter()
        .filter_map(|sample| sample.splitting.as_ref())
        .collect();

    BatchSummary {
        total_samples: samples.len(),
        scored_samples: scored.len(),
        failed_samples: samples.iter().filter(|sample| sample.error.is_some()).count(),
        count_matches: scored.iter().filter(|score| score.count_match).count(),
        average_overall_score: average(scored.iter().map(|score| score.overall_score)),
        average_type_accuracy: average(scored.iter().map(|score| score.type_accuracy)),
        average_page_numbers_accuracy: average(
            scored.iter().map(|score| score.page_numbers_accuracy),
        ),
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.iter().sum::<f64>() / collected.len() as f64
}
