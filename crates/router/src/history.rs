//! Semantic history matching.
//!
//! Compares the incoming utterance against the user's recent routed
//! utterances. With an embedder configured the comparison is cosine
//! similarity over embeddings; without one it degrades to character-bigram
//! Dice similarity so routing never hard-depends on an embedding endpoint.

use std::collections::HashSet;
use std::sync::Arc;

use av_domain::llm::Embedder;
use av_domain::Result;

/// A recent utterance and the route that served it.
#[derive(Debug, Clone)]
pub struct RoutedUtterance {
    pub text: String,
    pub route: String,
}

/// A history match above the similarity floor.
#[derive(Debug, Clone)]
pub struct HistoryMatch {
    pub route: String,
    pub similarity: f64,
}

pub struct HistoryMatcher {
    embedder: Option<Arc<dyn Embedder>>,
}

impl HistoryMatcher {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { embedder }
    }

    /// Best match among `history`, or `None` if below `min_similarity`.
    pub async fn best_match(
        &self,
        input: &str,
        history: &[RoutedUtterance],
        min_similarity: f64,
    ) -> Result<Option<HistoryMatch>> {
        if history.is_empty() || input.trim().is_empty() {
            return Ok(None);
        }

        let mut best: Option<HistoryMatch> = None;
        match &self.embedder {
            Some(embedder) => {
                let input_vec = embedder.embed(input).await?;
                for past in history {
                    let past_vec = embedder.embed(&past.text).await?;
                    let similarity = cosine_similarity(&input_vec, &past_vec) as f64;
                    consider(&mut best, past, similarity);
                }
            }
            None => {
                for past in history {
                    let similarity = bigram_dice(input, &past.text);
                    consider(&mut best, past, similarity);
                }
            }
        }

        Ok(best.filter(|m| m.similarity >= min_similarity))
    }
}

fn consider(best: &mut Option<HistoryMatch>, past: &RoutedUtterance, similarity: f64) {
    if best.as_ref().map(|b| similarity > b.similarity).unwrap_or(true) {
        *best = Some(HistoryMatch {
            route: past.route.clone(),
            similarity,
        });
    }
}

/// Cosine similarity between two vectors. Returns 0.0 on mismatched
/// lengths or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        tracing::warn!(
            len_a = a.len(),
            len_b = b.len(),
            "cosine_similarity: mismatched vector lengths, returning 0.0"
        );
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Dice coefficient over character bigrams. Works for CJK text where
/// whitespace tokenisation fails.
pub fn bigram_dice(a: &str, b: &str) -> f64 {
    let bigrams_a = bigrams(a);
    let bigrams_b = bigrams(b);
    if bigrams_a.is_empty() || bigrams_b.is_empty() {
        return if a.trim() == b.trim() && !a.trim().is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let intersection = bigrams_a.intersection(&bigrams_b).count();
    (2 * intersection) as f64 / (bigrams_a.len() + bigrams_b.len()) as f64
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
