use crate::model::{DocumentSegment, GroundTruthSegment, SegmentMatch, SplittingScore};

const TYPE_WEIGHT: f64 = 0.4;
const COUNT_WEIGHT: f64 = 0.3;
const PAGE_NUMBERS_WEIGHT: f64 = 0.3;

/// Compare predicted segments against ground truth and compute accuracy
/// metrics for one task.
///
/// Segments are paired by position: first predicted with first truth, and
/// so on, up to the shorter list. Surplus entries on either side count
/// against `count_match` and appear in the detail with one side absent,
/// but are excluded from every accuracy denominator. Positional pairing is
/// a known limitation (reordered segments score poorly even when every
/// range is right); existing accuracy baselines assume it, so it stays.
pub fn score(predicted: &[DocumentSegment], truth: &[GroundTruthSegment]) -> SplittingScore {
    let paired = predicted.len().min(truth.len());
    let reported = predicted.len().max(truth.len());

    let mut detail = Vec::with_capacity(reported);
    for i in 0..reported {
        detail.push(compare_pair(predicted.get(i), truth.get(i)));
    }

    let scored = &detail[..paired];
    let type_accuracy = percentage(scored.iter().filter(|m| m.kind_match).count(), paired);
    let page_count_accuracy = percentage(
        scored.iter().filter(|m| m.page_count_match).count(),
        paired,
    );
    let page_numbers_accuracy = percentage(
        scored.iter().filter(|m| m.page_numbers_match).count(),
        paired,
    );

    let count_match = predicted.len() == truth.len();
    let overall_score = TYPE_WEIGHT * type_accuracy
        + COUNT_WEIGHT * if count_match { 100.0 } else { 0.0 }
        + PAGE_NUMBERS_WEIGHT * page_numbers_accuracy;

    SplittingScore {
        predicted_count: predicted.len(),
        ground_truth_count: truth.len(),
        count_match,
        type_accuracy,
        page_count_accuracy,
        page_numbers_accuracy,
        overall_score,
        per_document_detail: detail,
    }
}

fn compare_pair(
    predicted: Option<&DocumentSegment>,
    truth: Option<&GroundTruthSegment>,
) -> SegmentMatch {
    let (kind_match, page_count_match, page_numbers_match) = match (predicted, truth) {
        (Some(pred), Some(gt)) => {
            // The fixture kind resolves through the filing-name mapping
            // first, then the short-code mapping; an unresolvable kind
            // never matches.
            let kind_match = gt.kind.is_some_and(|kind| kind == pred.kind);
            let page_count_match = pred.page_count() as usize == gt.page_count();

            let mut gt_pages = gt.pages.clone();
            gt_pages.sort_unstable();
            let page_numbers_match = pred.page_numbers() == gt_pages;

            (kind_match, page_count_match, page_numbers_match)
        }
        _ => (false, false, false),
    };

    SegmentMatch {
        predicted: predicted.cloned(),
        ground_truth: truth.cloned(),
        kind_match,
        page_count_match,
        page_numbers_match,
        exact_match: kind_match && page_count_match && page_numbers_match,
    }
}

fn percentage(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64 * 100.0
    }
}
