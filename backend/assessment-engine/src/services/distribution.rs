//! Exam question budget apportionment across content units.

use std::collections::HashMap;

use crate::models::{ContentUnit, Importance};

/// Difficulty assumed for units that carry no usable index.
const DEFAULT_DIFFICULTY: f64 = 3.0;

impl Importance {
    pub fn multiplier(&self) -> f64 {
        match self {
            Importance::High => 1.5,
            Importance::Medium => 1.0,
            Importance::Low => 0.7,
        }
    }
}

/// Planning weight of one unit: more concepts, higher difficulty and lower
/// mastery all pull more questions.
pub fn unit_weight(unit: &ContentUnit, importance: Importance) -> f64 {
    let difficulty = if unit.difficulty_index.is_finite() && unit.difficulty_index > 0.0 {
        unit.difficulty_index
    } else {
        DEFAULT_DIFFICULTY
    };
    let mastery = if unit.mastery_score.is_finite() {
        unit.mastery_score.clamp(0.0, 100.0)
    } else {
        0.0
    };

    f64::from(unit.concept_count) * difficulty * (100.0 - mastery) * importance.multiplier()
}

/// Splits `exam_total` questions across `units` with the largest-remainder
/// method. Counts always sum to `exam_total` for a non-empty input; leftover
/// seats go to the largest fractional shares, earlier units winning ties.
pub fn allocate(exam_total: u32, units: &[ContentUnit], importance: Importance) -> HashMap<String, u32> {
    if units.is_empty() {
        return HashMap::new();
    }

    let weights: Vec<f64> = units.iter().map(|u| unit_weight(u, importance)).collect();
    let weight_sum: f64 = weights.iter().sum();

    let shares: Vec<f64> = if weight_sum > 0.0 && weight_sum.is_finite() {
        weights
            .iter()
            .map(|w| w / weight_sum * f64::from(exam_total))
            .collect()
    } else {
        vec![f64::from(exam_total) / units.len() as f64; units.len()]
    };

    let mut counts: Vec<u32> = shares.iter().map(|s| s.floor() as u32).collect();
    let assigned: u32 = counts.iter().sum();
    let leftover = exam_total.saturating_sub(assigned) as usize;

    let mut order: Vec<usize> = (0..units.len()).collect();
    // sort_by is stable, so equal remainders keep input order
    order.sort_by(|&a, &b| {
        let ra = shares[a] - shares[a].floor();
        let rb = shares[b] - shares[b].floor();
        rb.total_cmp(&ra)
    });

    for &idx in order.iter().cycle().take(leftover) {
        counts[idx] += 1;
    }

    units
        .iter()
        .zip(counts)
        .map(|(unit, count)| (unit.id.clone(), count))
        .collect()
}
