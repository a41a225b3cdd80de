//! Scoring of extracted text, used to decide whether an extraction attempt
//! actually produced readable content.

use serde::Serialize;

pub const MIN_TEXT_CHARS: usize = 50;
pub const VALID_SCORE: f64 = 0.7;

const WHITESPACE_BAND: (f64, f64) = (0.1, 0.4);
const WHITESPACE_PENALTY: f64 = 0.1;
const ALLOWED_PUNCTUATION: &str = ".,;:!?()-";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct QualityMetrics {
    pub total_chars: usize,
    pub valid_ratio: f64,
    pub replacement_ratio: f64,
    pub whitespace_ratio: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QualityReport {
    pub valid: bool,
    pub score: f64,
    pub reason: String,
    pub metrics: QualityMetrics,
}

impl QualityReport {
    fn rejected(reason: &str) -> Self {
        Self {
            valid: false,
            score: 0.0,
            reason: reason.to_string(),
            metrics: QualityMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextQualityValidator {
    pub min_chars: usize,
    pub valid_score: f64,
}

impl Default for TextQualityValidator {
    fn default() -> Self {
        Self {
            min_chars: MIN_TEXT_CHARS,
            valid_score: VALID_SCORE,
        }
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || ('\u{00C0}'..='\u{00FF}').contains(&c)
        || c.is_whitespace()
        || ALLOWED_PUNCTUATION.contains(c)
}

impl TextQualityValidator {
    pub fn validate(&self, text: &str) -> QualityReport {
        if text.trim().chars().count() < self.min_chars {
            return QualityReport::rejected("text is empty or too short");
        }

        let mut total = 0usize;
        let mut valid = 0usize;
        let mut replacement = 0usize;
        let mut whitespace = 0usize;
        for c in text.chars() {
            total += 1;
            if is_allowed(c) {
                valid += 1;
            }
            if c == '\u{FFFD}' {
                replacement += 1;
            }
            if c.is_whitespace() {
                whitespace += 1;
            }
        }

        let total_f = total as f64;
        let metrics = QualityMetrics {
            total_chars: total,
            valid_ratio: valid as f64 / total_f,
            replacement_ratio: replacement as f64 / total_f,
            whitespace_ratio: whitespace as f64 / total_f,
        };

        let mut score = metrics.valid_ratio - 2.0 * metrics.replacement_ratio;
        let (low, high) = WHITESPACE_BAND;
        if metrics.whitespace_ratio < low || metrics.whitespace_ratio > high {
            score -= WHITESPACE_PENALTY;
        }
        let score = score.clamp(0.0, 1.0);
        let valid = score >= self.valid_score;

        let reason = if valid {
            "text quality acceptable".to_string()
        } else if metrics.replacement_ratio > 0.0 {
            format!(
                "score {score:.2}: {:.0}% replacement characters",
                metrics.replacement_ratio * 100.0
            )
        } else {
            format!(
                "score {score:.2}: {:.0}% unexpected characters",
                (1.0 - metrics.valid_ratio) * 100.0
            )
        };

        QualityReport {
            valid,
            score,
            reason,
            metrics,
        }
    }
}
