//! Acceptance test for newly trained models
//!
//! A model is published only when its score clears an absolute floor and
//! does not regress more than `allowable_drop` below the best score accepted
//! so far. Half a ULP of the score is added before comparing so values that
//! differ from a threshold only by round-off still pass.

use crate::models::AcceptanceResult;
use regex::Regex;
use std::sync::OnceLock;

static TOTAL_LINE: OnceLock<Regex> = OnceLock::new();
static NUMBER: OnceLock<Regex> = OnceLock::new();

fn total_line() -> &'static Regex {
    TOTAL_LINE.get_or_init(|| {
        Regex::new(
            r"(?i)TOTAL:\s*precision:\s*([0-9]*\.?[0-9]+)\s*%\s*;\s*recall:\s*([0-9]*\.?[0-9]+)\s*%\s*;\s*F1:\s*([0-9]*\.?[0-9]+)\s*%",
        )
        .expect("valid TOTAL regex")
    })
}

fn number() -> &'static Regex {
    NUMBER.get_or_init(|| Regex::new(r"([0-9]*\.?[0-9]+)\s*(%)?").expect("valid number regex"))
}

/// Extract a score in `[0, 1]` from tester output
///
/// Two formats are understood:
/// - `TOTAL: precision: P%; recall: R%; F1: F%` (the F1 percentage is used)
/// - a `Testing Set Accuracy` section containing an `F1 Score...` entry
pub fn parse_score(text: &str) -> Option<f64> {
    if let Some(caps) = total_line().captures(text) {
        let f1: f64 = caps.get(3)?.as_str().parse().ok()?;
        return normalize(f1 / 100.0);
    }
    parse_accuracy_block(text)
}

fn parse_accuracy_block(text: &str) -> Option<f64> {
    let mut in_testing_section = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.to_lowercase().contains("testing set accuracy") {
            in_testing_section = true;
            continue;
        }
        if !in_testing_section {
            continue;
        }
        if !trimmed.to_lowercase().starts_with("f1 score") {
            continue;
        }

        // skip the "F1 Score" label, then the dot leader
        let value_text = trimmed.get("f1 score".len()..)?;
        let caps = number().captures(value_text)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let is_percent = caps.get(2).is_some() || value > 1.0;
        return normalize(if is_percent { value / 100.0 } else { value });
    }
    None
}

fn normalize(score: f64) -> Option<f64> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Some(score)
    } else {
        None
    }
}

/// Distance from `x` to the next representable value away from zero
pub fn unit_in_last_place(x: f64) -> f64 {
    if !x.is_finite() {
        return f64::NAN;
    }
    let magnitude = x.abs();
    if magnitude == f64::MAX {
        return magnitude - f64::from_bits(magnitude.to_bits() - 1);
    }
    f64::from_bits(magnitude.to_bits() + 1) - magnitude
}

/// The acceptance ratchet
pub fn criteria_met(score: f64, minimum_score: f64, allowable_drop: f64, previous_best: f64) -> bool {
    let half_ulp = unit_in_last_place(score) / 2.0;
    score + half_ulp >= minimum_score && score + half_ulp + allowable_drop >= previous_best
}

/// Configured thresholds for one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceEvaluator {
    pub minimum_score: f64,
    pub allowable_drop: f64,
}

impl AcceptanceEvaluator {
    pub fn new(minimum_score: f64, allowable_drop: f64) -> Self {
        Self {
            minimum_score,
            allowable_drop,
        }
    }

    /// Evaluate tester output. Unparseable output is a rejection with a
    /// score of zero.
    pub fn evaluate(
        &self,
        result_text: &str,
        previous_best: f64,
        first_id_processed: i64,
        last_id_processed: i64,
    ) -> AcceptanceResult {
        let (criteria_met, score) = match parse_score(result_text) {
            Some(score) => (
                criteria_met(score, self.minimum_score, self.allowable_drop, previous_best),
                score,
            ),
            None => (false, 0.0),
        };

        AcceptanceResult {
            criteria_met,
            first_id_processed,
            last_id_processed,
            score,
        }
    }

    /// Best score to carry forward after a decision
    pub fn next_best(&self, result: &AcceptanceResult, previous_best: f64) -> f64 {
        if result.criteria_met {
            result.score
        } else {
            previous_best
        }
    }

    /// Human readable reason for a rejection
    pub fn rejection_reason(&self, result: &AcceptanceResult, previous_best: f64) -> String {
        if result.score == 0.0 {
            return "no score could be read from the tester output".to_string();
        }
        let half_ulp = unit_in_last_place(result.score) / 2.0;
        if result.score + half_ulp < self.minimum_score {
            format!(
                "score {:.4} below minimum {:.4}",
                result.score, self.minimum_score
            )
        } else {
            format!(
                "score {:.4} regressed more than {:.4} below best {:.4}",
                result.score, self.allowable_drop, previous_best
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_total_line() {
        let text = "training done\nTOTAL: precision: 81.5%; recall: 78.2%; F1: 79.84%\n";
        let score = parse_score(text).unwrap();
        assert!((score - 0.7984).abs() < 1e-12);
    }

    #[test]
    fn test_parse_accuracy_block() {
        let text = "Training Set Accuracy\n  F1 Score..........: 0.99\n\nTesting Set Accuracy\n  Precision.........: 0.81\n  F1 Score..........: 0.83\n";
        assert_eq!(parse_score(text), Some(0.83));
    }

    #[test]
    fn test_parse_accuracy_block_percent() {
        let text = "Testing Set Accuracy\nF1 Score: 83.5%\n";
        let score = parse_score(text).unwrap();
        assert!((score - 0.835).abs() < 1e-12);
    }

    #[test]
    fn test_parse_ignores_training_section_only() {
        let text = "Training Set Accuracy\nF1 Score..........: 0.99\n";
        assert_eq!(parse_score(text), None);
        assert_eq!(parse_score("garbage"), None);
        assert_eq!(parse_score("TOTAL: precision: 10%; recall: 10%; F1: 250%"), None);
    }

    #[test]
    fn test_unit_in_last_place() {
        assert_eq!(unit_in_last_place(1.0), f64::EPSILON);
        assert!(unit_in_last_place(0.5) < f64::EPSILON);
        assert!(unit_in_last_place(0.0) > 0.0);
        assert!(unit_in_last_place(f64::NAN).is_nan());
    }

    #[test]
    fn test_score_equal_to_minimum_is_accepted() {
        let minimum = 0.6;
        let drop = 0.05;
        assert!(criteria_met(minimum, minimum, drop, minimum + drop));
        assert!(criteria_met(minimum, minimum, drop, 0.0));
        assert!(!criteria_met(minimum, minimum, drop, minimum + drop + 0.01));
    }

    #[test]
    fn test_round_off_is_absorbed() {
        // 0.1 + 0.2 != 0.3 in binary floating point
        let score = 0.1 + 0.2;
        assert!(criteria_met(0.3, score, 0.0, 0.0));
        assert!(criteria_met(score, 0.3, 0.0, 0.0));
    }

    #[test]
    fn test_ratchet_forbids_regression() {
        assert!(criteria_met(0.80, 0.6, 0.05, 0.84));
        assert!(!criteria_met(0.78, 0.6, 0.05, 0.84));
    }

    #[test]
    fn test_evaluate_accepts_and_updates_best() {
        let evaluator = AcceptanceEvaluator::new(0.6, 0.05);
        let result = evaluator.evaluate("TOTAL: precision: 80%; recall: 80%; F1: 80%", 0.0, 10, 12);

        assert!(result.criteria_met);
        assert_eq!(result.first_id_processed, 10);
        assert_eq!(result.last_id_processed, 12);
        assert!((result.score - 0.8).abs() < 1e-12);
        assert_eq!(evaluator.next_best(&result, 0.0), result.score);
    }

    #[test]
    fn test_evaluate_rejects_below_minimum_and_keeps_best() {
        let evaluator = AcceptanceEvaluator::new(0.6, 0.05);
        let result = evaluator.evaluate("TOTAL: precision: 50%; recall: 50%; F1: 50%", 0.55, 1, 2);

        assert!(!result.criteria_met);
        assert_eq!(evaluator.next_best(&result, 0.55), 0.55);
        assert!(evaluator
            .rejection_reason(&result, 0.55)
            .contains("below minimum"));
    }

    #[test]
    fn test_evaluate_unparseable_is_rejection() {
        let evaluator = AcceptanceEvaluator::new(0.0, 1.0);
        let result = evaluator.evaluate("segfault", 0.0, 1, 2);
        assert!(!result.criteria_met);
        assert_eq!(result.score, 0.0);
        assert!(evaluator
            .rejection_reason(&result, 0.0)
            .contains("no score"));
    }
}
