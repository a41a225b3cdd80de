use std::collections::BTreeMap;

/// Tokens of this many characters or fewer carry no weight.
pub const MIN_TERM_CHARS: usize = 3;

/// Sparse term-weight vector. Terms are kept ordered so that sums over the
/// vector are reproducible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    weights: BTreeMap<String, f64>,
}

impl SparseVector {
    pub fn from_weights(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn weight(&self, term: &str) -> f64 {
        self.weights.get(term).copied().unwrap_or(0.0)
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(term, weight)| (term.as_str(), *weight))
    }

    pub fn magnitude(&self) -> f64 {
        self.weights.values().map(|value| value * value).sum::<f64>().sqrt()
    }
}

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> SparseVector;
}

/// L2-normalised term-frequency vectors over lower-cased word tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermFrequencyEmbedder;

impl Embedder for TermFrequencyEmbedder {
    fn embed(&self, text: &str) -> SparseVector {
        let mut counts = BTreeMap::<String, f64>::new();
        for token in tokenize(text) {
            *counts.entry(token).or_insert(0.0) += 1.0;
        }

        let magnitude = counts.values().map(|value| value * value).sum::<f64>().sqrt();
        if magnitude > 0.0 {
            for value in counts.values_mut() {
                *value /= magnitude;
            }
        }

        SparseVector::from_weights(counts)
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .filter(|token| token.chars().count() >= MIN_TERM_CHARS)
        .map(str::to_lowercase)
}

/// Cosine of the angle between two sparse vectors, computed over the union of
/// their terms. Returns 0 when either side has no weight.
pub fn cosine_similarity(left: &SparseVector, right: &SparseVector) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let (small, large) = if left.len() <= right.len() {
        (left, right)
    } else {
        (right, left)
    };
    let dot = small
        .terms()
        .map(|(term, weight)| weight * large.weight(term))
        .sum::<f64>();

    let magnitude = left.magnitude() * right.magnitude();
    if magnitude <= f64::EPSILON {
        return 0.0;
    }

    (dot / magnitude).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = TermFrequencyEmbedder;
        let first = embedder.embed("Julgo procedente o pedido do autor");
        let second = embedder.embed("Julgo procedente o pedido do autor");
        assert_eq!(first, second);
    }

    #[test]
    fn short_tokens_and_punctuation_are_dropped() {
        let vector = TermFrequencyEmbedder.embed("O réu, de fato, NÃO compareceu.");
        assert_eq!(vector.weight("o"), 0.0);
        assert_eq!(vector.weight("de"), 0.0);
        assert!(vector.weight("réu") > 0.0);
        assert!(vector.weight("não") > 0.0);
        assert!(vector.weight("compareceu") > 0.0);
        assert!(vector.weight("fato,") == 0.0);
    }

    #[test]
    fn vectors_are_unit_length() {
        let vector = TermFrequencyEmbedder.embed("contrato contrato cláusula multa");
        assert!((vector.magnitude() - 1.0).abs() < 1e-9);
        assert!(vector.weight("contrato") > vector.weight("multa"));
    }

    #[test]
    fn self_similarity_is_one_and_bounds_hold() {
        let embedder = TermFrequencyEmbedder;
        let a = embedder.embed("sentença julgo procedente pedido indenização");
        let b = embedder.embed("contrato locação cláusula multa pedido");
        let empty = embedder.embed("a o e");

        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);
        let cross = cosine_similarity(&a, &b);
        assert!((0.0..=1.0).contains(&cross));
        assert!(cross > 0.0);
        assert_eq!(cosine_similarity(&a, &empty), 0.0);
        assert_eq!(cosine_similarity(&empty, &empty), 0.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        let embedder = TermFrequencyEmbedder;
        let a = embedder.embed("recurso apelação tribunal desembargador relator");
        let b = embedder.embed("tribunal relator voto recurso");
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 1e-12);
    }
}
