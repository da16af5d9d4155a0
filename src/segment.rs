use std::collections::BTreeSet;

use crate::error::SegmentationError;
use crate::model::{DocumentKind, DocumentSegment, RawSegment};

/// Turn raw model output into verified segments or reject it.
///
/// This is the last line of defense against hallucinated output: every
/// downstream consumer assumes the invariants enforced here. Pure function;
/// identical input always produces an identical verdict.
///
/// Rules:
/// - a type tag outside the closed set is `UnknownType` (a literal
///   `Unknown` tag is a valid classification, and a missing tag coerces to
///   it, matching what the upstream extractor has always done);
/// - a missing or inverted page range, or one outside `1..=total_pages`,
///   is `OutOfRange`;
/// - any page claimed by two segments is `Overlap`, found deterministically
///   by scanning page order regardless of input ordering;
/// - missing confidence coerces to `0.0` and is never grounds for
///   rejection;
/// - uncovered pages are not an error here; see [`unclassified_gap_pages`].
pub fn validate_segments(
    raw_segments: &[RawSegment],
    total_pages: u32,
) -> Result<Vec<DocumentSegment>, SegmentationError> {
    let mut segments = Vec::with_capacity(raw_segments.len());

    for (index, raw) in raw_segments.iter().enumerate() {
        let tag = raw.doc_type.as_deref().unwrap_or("Unknown");
        let kind = DocumentKind::from_tag(tag).ok_or_else(|| SegmentationError::UnknownType {
            index,
            tag: tag.to_string(),
        })?;

        let start = raw.start_page.unwrap_or(0);
        let end = raw.end_page.unwrap_or(0);
        if start < 1 || end < start || end > i64::from(total_pages) {
            return Err(SegmentationError::OutOfRange {
                index,
                start,
                end,
                total_pages,
            });
        }

        segments.push(DocumentSegment {
            kind,
            kind_confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            start_page: start as u32,
            end_page: end as u32,
            fields: raw.fields.clone(),
        });
    }

    check_disjoint(&segments)?;

    Ok(segments)
}

/// Reject any pair of segments sharing a page. Ranges are examined in page
/// order so the reported pair and page do not depend on input ordering.
fn check_disjoint(segments: &[DocumentSegment]) -> Result<(), SegmentationError> {
    let mut order: Vec<usize> = (0..segments.len()).collect();
    order.sort_by_key(|&i| (segments[i].start_page, segments[i].end_page, i));

    for pair in order.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if segments[second].start_page <= segments[first].end_page {
            let (first_index, second_index) = if first < second {
                (first, second)
            } else {
                (second, first)
            };
            return Err(SegmentationError::Overlap {
                first_index,
                second_index,
                page: segments[second].start_page,
            });
        }
    }

    Ok(())
}

/// Pages of the source document not claimed by any segment. Gaps are
/// surfaced as a warning and a report count, never a validation failure.
pub fn unclassified_gap_pages(segments: &[DocumentSegment], total_pages: u32) -> Vec<u32> {
    let covered: BTreeSet<u32> = segments
        .iter()
        .flat_map(|segment| segment.start_page..=segment.end_page)
        .collect();

    (1..=total_pages)
        .filter(|page| !covered.contains(page))
        .collect()
}

/// Upper page bound for validation when the task message carries no page
/// count: the largest end page the model claims. Range checking then only
/// enforces ordering and positivity, which is the best available without a
/// local PDF parser.
pub fn inferred_total_pages(raw_segments: &[RawSegment]) -> u32 {
    raw_segments
        .iter()
        .filter_map(|raw| raw.end_page)
        .filter(|&end| end >= 1 && end <= i64::from(u32::MAX))
        .map(|end| end as u32)
        .max()
        .unwrap_or(1)
}
