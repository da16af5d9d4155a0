use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{FieldComparison, FieldScore};

/// Compare extracted field values against ground truth for one document
/// instance.
///
/// The ground-truth key set drives the iteration: a field present in
/// ground truth but missing from the extraction counts as incorrect, and
/// extra extracted fields are ignored, not penalized. `score` is `None`
/// when the ground truth has no fields at all, which callers must keep
/// distinct from a 0% score.
pub fn score(
    extracted: &BTreeMap<String, Value>,
    ground_truth: &BTreeMap<String, Value>,
) -> FieldScore {
    let mut field_comparison = BTreeMap::new();
    let mut correct_fields = 0usize;

    for (name, gt_value) in ground_truth {
        let extracted_value = extracted.get(name);
        let correct = match extracted_value {
            Some(value) => values_equal(value, gt_value),
            None => false,
        };
        if correct {
            correct_fields += 1;
        }

        field_comparison.insert(
            name.clone(),
            FieldComparison {
                extracted: extracted_value.cloned(),
                ground_truth: gt_value.clone(),
                correct,
            },
        );
    }

    let total_fields = ground_truth.len();
    let score = if total_fields == 0 {
        None
    } else {
        Some(correct_fields as f64 / total_fields as f64 * 100.0)
    };

    FieldScore {
        total_fields,
        correct_fields,
        score,
        field_comparison,
    }
}

/// Type-aware equality: numerics compare exactly after coercing both sides
/// to f64 (so `"7632.00"` equals `7632.0`), strings compare trimmed and
/// case-sensitive, both-null is correct, one-sided null is not. Anything
/// else falls back to strict JSON equality.
fn values_equal(extracted: &Value, ground_truth: &Value) -> bool {
    match (extracted, ground_truth) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => {
            if let (Some(left), Some(right)) = (as_number(extracted), as_number(ground_truth)) {
                return left == right;
            }
            if let (Value::String(left), Value::String(right)) = (extracted, ground_truth) {
                return left.trim() == right.trim();
            }
            extracted == ground_truth
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}
