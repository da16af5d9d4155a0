use crate::model::{DocumentSegment, PageClassification};

/// Group consecutive same-kind page classifications into document
/// segments. Used when the model emits one label per page instead of
/// page ranges.
///
/// A segment closes when the kind changes or the page numbering jumps;
/// confidence is never part of the grouping key. A single trailing page
/// of a new kind forms its own one-page segment. The output is contiguous
/// and non-overlapping by construction for any input whose page numbers
/// are distinct, so it always passes `validate_segments`; the pipeline
/// still runs the checker over it as a cross-check.
pub fn group_consecutive(page_classifications: &[PageClassification]) -> Vec<DocumentSegment> {
    let mut ordered: Vec<&PageClassification> = page_classifications.iter().collect();
    ordered.sort_by_key(|cls| cls.page_number);

    let mut segments = Vec::new();
    let mut run: Vec<&PageClassification> = Vec::new();

    for cls in ordered {
        let breaks_run = run.last().is_some_and(|prev| {
            prev.kind != cls.kind || prev.page_number + 1 != cls.page_number
        });
        if breaks_run {
            segments.push(close_run(&run));
            run.clear();
        }
        run.push(cls);
    }

    if !run.is_empty() {
        segments.push(close_run(&run));
    }

    segments
}

fn close_run(run: &[&PageClassification]) -> DocumentSegment {
    // Segment confidence is the weakest page confidence in the run;
    // informational only.
    let confidence = run
        .iter()
        .map(|cls| cls.confidence.unwrap_or(0.0))
        .fold(f64::INFINITY, f64::min);

    DocumentSegment {
        kind: run[0].kind,
        kind_confidence: if confidence.is_finite() { confidence } else { 0.0 },
        start_page: run[0].page_number,
        end_page: run[run.len() - 1].page_number,
        fields: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{DocumentKind, RawSegment};
    use crate::segment::validate_segments;

    fn page(page_number: u32, kind: DocumentKind) -> PageClassification {
        PageClassification {
            page_number,
            kind,
            confidence: Some(0.9),
        }
    }

    #[test]
    fn groups_consecutive_pages_of_same_kind() {
        let pages = vec![
            page(1, DocumentKind::Invoice),
            page(2, DocumentKind::Invoice),
            page(3, DocumentKind::PackingList),
            page(4, DocumentKind::PackingList),
            page(5, DocumentKind::PackingList),
        ];

        let segments = group_consecutive(&pages);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].kind, DocumentKind::Invoice);
        assert_eq!((segments[0].start_page, segments[0].end_page), (1, 2));
        assert_eq!(segments[1].kind, DocumentKind::PackingList);
        assert_eq!((segments[1].start_page, segments[1].end_page), (3, 5));
    }

    #[test]
    fn trailing_single_page_forms_its_own_segment() {
        let pages = vec![
            page(1, DocumentKind::Invoice),
            page(2, DocumentKind::Invoice),
            page(3, DocumentKind::Hawb),
        ];

        let segments = group_consecutive(&pages);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].kind, DocumentKind::Hawb);
        assert_eq!(segments[1].page_count(), 1);
    }

    #[test]
    fn confidence_changes_do_not_close_a_segment() {
        let pages = vec![
            PageClassification {
                page_number: 1,
                kind: DocumentKind::Obl,
                confidence: Some(0.95),
            },
            PageClassification {
                page_number: 2,
                kind: DocumentKind::Obl,
                confidence: Some(0.40),
            },
        ];

        let segments = group_consecutive(&pages);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind_confidence, 0.40);
    }

    #[test]
    fn page_number_jump_closes_a_segment() {
        let pages = vec![
            page(1, DocumentKind::Invoice),
            page(2, DocumentKind::Invoice),
            page(5, DocumentKind::Invoice),
        ];

        let segments = group_consecutive(&pages);
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start_page, segments[0].end_page), (1, 2));
        assert_eq!((segments[1].start_page, segments[1].end_page), (5, 5));
    }

    #[test]
    fn empty_input_yields_no_segments() {
        assert!(group_consecutive(&[]).is_empty());
    }

    #[test]
    fn grouped_output_round_trips_through_the_checker() {
        let pages = vec![
            page(1, DocumentKind::Invoice),
            page(2, DocumentKind::PackingList),
            page(3, DocumentKind::PackingList),
            page(4, DocumentKind::Unknown),
            page(6, DocumentKind::Obl),
        ];

        let segments = group_consecutive(&pages);
        let raw: Vec<RawSegment> = segments
            .iter()
            .map(|segment| RawSegment {
                doc_type: Some(segment.kind.as_str().to_string()),
                start_page: Some(i64::from(segment.start_page)),
                end_page: Some(i64::from(segment.end_page)),
                confidence: Some(segment.kind_confidence),
                fields: BTreeMap::new(),
            })
            .collect();

        let validated = validate_segments(&raw, 6).unwrap();
        assert_eq!(validated.len(), segments.len());
    }
}
