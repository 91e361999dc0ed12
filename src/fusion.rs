//! Result fusion.
//!
//! Reconciles the fast and accurate engines' outputs for one document into a
//! single result. Four strategies each produce a candidate; a quality scorer
//! picks the winner. Fusion is fully deterministic: fixed inputs always
//! select the same strategy and produce the same text and confidence.

use serde::Serialize;

use crate::error::RecognitionError;
use crate::model::{PageRecognition, RecognitionResult, ResultStatus};

/// Similarity above which the two engines are considered to substantially
/// agree, making confidence a better discriminator than length.
const AGREEMENT_THRESHOLD: f64 = 0.8;

/// Quality score weights: confidence, relative completeness, coherence.
const W_CONFIDENCE: f64 = 0.4;
const W_COMPLETENESS: f64 = 0.3;
const W_COHERENCE: f64 = 0.3;

/// The four fusion strategies, in tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    Confidence,
    Length,
    Similarity,
    PageAligned,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confidence => "confidence",
            Self::Length => "length",
            Self::Similarity => "similarity",
            Self::PageAligned => "page_aligned",
        }
    }
}

/// One strategy's candidate output.
#[derive(Debug, Clone)]
pub struct FusionCandidate {
    pub strategy: FusionStrategy,
    pub text: String,
    pub confidence: f32,
    pub pages: Vec<PageRecognition>,
}

/// The chosen fusion output.
#[derive(Debug, Clone)]
pub struct FusedOutcome {
    pub text: String,
    pub confidence: f32,
    pub pages: Vec<PageRecognition>,
    pub strategy: FusionStrategy,
    /// Edit similarity between the two inputs, recorded for diagnostics.
    pub similarity: f64,
    /// Quality score of the winning candidate.
    pub quality_score: f64,
}

/// Fuse two engine results into one.
///
/// Never errors on disagreement; fails only when both inputs are failed.
/// With exactly one failed input the surviving result is returned as-is
/// under the confidence strategy.
pub fn fuse(
    fast: &RecognitionResult,
    accurate: &RecognitionResult,
) -> Result<FusedOutcome, RecognitionError> {
    let fast_ok = fast.status == ResultStatus::Completed;
    let accurate_ok = accurate.status == ResultStatus::Completed;

    match (fast_ok, accurate_ok) {
        (false, false) => {
            return Err(RecognitionError::EngineFailure(format!(
                "Both engine results failed for document {}",
                fast.document_id
            )))
        }
        (true, false) => return Ok(passthrough(fast)),
        (false, true) => return Ok(passthrough(accurate)),
        (true, true) => {}
    }

    let similarity = similarity_ratio(&fast.text, &accurate.text);
    let candidates = strategy_candidates(fast, accurate, similarity);

    let max_input_len = fast.text.chars().count().max(accurate.text.chars().count());
    if max_input_len == 0 {
        // Degenerate: nothing to score, take whichever raw input claims more
        // confidence.
        let winner = if confidence_of(fast) >= confidence_of(accurate) {
            fast
        } else {
            accurate
        };
        let mut outcome = passthrough(winner);
        outcome.similarity = similarity;
        return Ok(outcome);
    }

    let mut best: Option<(f64, FusionCandidate)> = None;
    for candidate in candidates {
        let score = quality_score(&candidate, max_input_len);
        // Strictly greater keeps the earlier strategy on ties.
        let better = match &best {
            Some((best_score, _)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((score, candidate));
        }
    }

    let (quality_score, winner) =
        best.ok_or_else(|| RecognitionError::Internal("No fusion candidate".to_string()))?;

    Ok(FusedOutcome {
        text: winner.text,
        confidence: winner.confidence,
        pages: winner.pages,
        strategy: winner.strategy,
        similarity,
        quality_score,
    })
}

/// Build each strategy's candidate. Exposed for diagnostics and tests.
pub fn strategy_candidates(
    fast: &RecognitionResult,
    accurate: &RecognitionResult,
    similarity: f64,
) -> Vec<FusionCandidate> {
    let fast_conf = confidence_of(fast);
    let accurate_conf = confidence_of(accurate);

    // 1. Confidence-based: higher whole-document confidence wins.
    let by_confidence = if fast_conf >= accurate_conf {
        fast
    } else {
        accurate
    };
    let confidence_candidate = FusionCandidate {
        strategy: FusionStrategy::Confidence,
        text: by_confidence.text.clone(),
        confidence: confidence_of(by_confidence),
        pages: by_confidence.pages.clone(),
    };

    // 2. Length-based: longer text as a proxy for completeness.
    let by_length = if fast.text.chars().count() >= accurate.text.chars().count() {
        fast
    } else {
        accurate
    };
    let length_candidate = FusionCandidate {
        strategy: FusionStrategy::Length,
        text: by_length.text.clone(),
        confidence: (fast_conf + accurate_conf) / 2.0,
        pages: by_length.pages.clone(),
    };

    // 3. Similarity-based: when the engines substantially agree, confidence
    //    discriminates; otherwise prefer completeness. Agreement is rewarded.
    let by_similarity = if similarity > AGREEMENT_THRESHOLD {
        by_confidence
    } else {
        by_length
    };
    let similarity_candidate = FusionCandidate {
        strategy: FusionStrategy::Similarity,
        text: by_similarity.text.clone(),
        confidence: confidence_of(by_similarity) * ((1.0 + similarity) as f32 / 2.0),
        pages: by_similarity.pages.clone(),
    };

    // 4. Page-aligned: pick the better page at each index.
    let page_count = fast.pages.len().max(accurate.pages.len());
    let mut selected = Vec::with_capacity(page_count);
    for i in 0..page_count {
        let winner = match (fast.pages.get(i), accurate.pages.get(i)) {
            (Some(f), Some(a)) => {
                if f.confidence >= a.confidence {
                    f
                } else {
                    a
                }
            }
            (Some(f), None) => f,
            (None, Some(a)) => a,
            (None, None) => continue,
        };
        selected.push(winner.clone());
    }
    let page_text = selected
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let page_confidence = if selected.is_empty() {
        0.0
    } else {
        selected.iter().map(|p| p.confidence).sum::<f32>() / selected.len() as f32
    };
    let page_candidate = FusionCandidate {
        strategy: FusionStrategy::PageAligned,
        text: page_text,
        confidence: page_confidence,
        pages: selected,
    };

    vec![
        confidence_candidate,
        length_candidate,
        similarity_candidate,
        page_candidate,
    ]
}

/// Weighted quality metric used to choose among strategy candidates.
pub fn quality_score(candidate: &FusionCandidate, max_input_len: usize) -> f64 {
    let completeness =
        (candidate.text.chars().count() as f64 / max_input_len as f64).min(1.0);
    W_CONFIDENCE * candidate.confidence as f64
        + W_COMPLETENESS * completeness
        + W_COHERENCE * coherence(&candidate.text)
}

/// Fraction of whitespace-delimited tokens containing at least one alphabetic
/// character. Garbled recognition output tends to produce symbol-only tokens.
fn coherence(text: &str) -> f64 {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let alphabetic = tokens
        .iter()
        .filter(|t| t.chars().any(|c| c.is_alphabetic()))
        .count();
    alphabetic as f64 / tokens.len() as f64
}

/// Normalized edit similarity in [0,1]: 1 - levenshtein / max_len.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a_chars, &b_chars);
    1.0 - distance as f64 / max_len as f64
}

/// Two-row Levenshtein distance over chars.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()]
}

fn confidence_of(result: &RecognitionResult) -> f32 {
    result.confidence.unwrap_or(0.0)
}

fn passthrough(result: &RecognitionResult) -> FusedOutcome {
    FusedOutcome {
        text: result.text.clone(),
        confidence: confidence_of(result),
        pages: result.pages.clone(),
        strategy: FusionStrategy::Confidence,
        similarity: 0.0,
        quality_score: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EngineKind;

    fn page(n: u32, text: &str, confidence: f32) -> PageRecognition {
        PageRecognition {
            page_number: n,
            text: text.to_string(),
            confidence,
            word_count: text.split_whitespace().count() as u32,
        }
    }

    fn result(
        engine: EngineKind,
        text: &str,
        confidence: f32,
        pages: Vec<PageRecognition>,
    ) -> RecognitionResult {
        let mut r = RecognitionResult::pending("doc-1", engine, "default-eng");
        r.text = text.to_string();
        r.confidence = Some(confidence);
        r.pages = pages;
        r.status = ResultStatus::Completed;
        r
    }

    fn failed(engine: EngineKind) -> RecognitionResult {
        let mut r = RecognitionResult::pending("doc-1", engine, "default-eng");
        r.status = ResultStatus::Failed;
        r.error = Some("engine exploded".to_string());
        r
    }

    #[test]
    fn similarity_ratio_bounds() {
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abc", "abc"), 1.0);
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
        let partial = similarity_ratio("kitten", "sitting");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn fusion_is_deterministic() {
        let fast = result(EngineKind::Fast, "invoice total 42.00", 0.82, vec![]);
        let accurate = result(EngineKind::Accurate, "invoice total 42.00 EUR", 0.75, vec![]);

        let first = fuse(&fast, &accurate).unwrap();
        for _ in 0..5 {
            let again = fuse(&fast, &accurate).unwrap();
            assert_eq!(again.strategy, first.strategy);
            assert_eq!(again.text, first.text);
            assert_eq!(again.confidence, first.confidence);
        }
    }

    #[test]
    fn agreeing_engines_pick_by_confidence_not_length() {
        // Near-identical texts: similarity well above the agreement
        // threshold, so the similarity strategy must side with confidence
        // even though the accurate text is longer.
        let fast = result(
            EngineKind::Fast,
            "the quick brown fox jumps over the lazy dog",
            0.9,
            vec![],
        );
        let accurate = result(
            EngineKind::Accurate,
            "the quick brown fox jumps over the lazy dog.",
            0.5,
            vec![],
        );

        let s = similarity_ratio(&fast.text, &accurate.text);
        assert!(s > 0.8, "fixture texts must agree, got {}", s);

        let candidates = strategy_candidates(&fast, &accurate, s);
        let similarity_candidate = candidates
            .iter()
            .find(|c| c.strategy == FusionStrategy::Similarity)
            .unwrap();
        let confidence_candidate = candidates
            .iter()
            .find(|c| c.strategy == FusionStrategy::Confidence)
            .unwrap();

        assert_eq!(similarity_candidate.text, confidence_candidate.text);
        assert_eq!(similarity_candidate.text, fast.text);
    }

    #[test]
    fn disagreeing_engines_pick_by_length() {
        let fast = result(EngineKind::Fast, "A B C", 0.9, vec![]);
        let accurate = result(EngineKind::Accurate, "totally different words here", 0.5, vec![]);

        let s = similarity_ratio(&fast.text, &accurate.text);
        assert!(s < 0.8);

        let candidates = strategy_candidates(&fast, &accurate, s);
        let similarity_candidate = candidates
            .iter()
            .find(|c| c.strategy == FusionStrategy::Similarity)
            .unwrap();

        assert_eq!(similarity_candidate.text, accurate.text);
        // Reward factor applies to the winner's confidence
        let expected = 0.5 * ((1.0 + s) as f32 / 2.0);
        assert!((similarity_candidate.confidence - expected).abs() < 1e-6);
    }

    #[test]
    fn page_alignment_interleaves_winning_pages() {
        let fast = result(
            EngineKind::Fast,
            "f1\n\nf2\n\nf3",
            0.7,
            vec![page(1, "f1", 0.9), page(2, "f2", 0.3), page(3, "f3", 0.8)],
        );
        let accurate = result(
            EngineKind::Accurate,
            "a1\n\na2\n\na3",
            0.7,
            vec![page(1, "a1", 0.5), page(2, "a2", 0.9), page(3, "a3", 0.4)],
        );

        let candidates = strategy_candidates(&fast, &accurate, 0.0);
        let aligned = candidates
            .iter()
            .find(|c| c.strategy == FusionStrategy::PageAligned)
            .unwrap();

        assert_eq!(aligned.text, "f1\n\na2\n\nf3");
        let expected_conf = (0.9 + 0.9 + 0.8) / 3.0;
        assert!((aligned.confidence - expected_conf).abs() < 1e-6);
    }

    #[test]
    fn page_alignment_uses_sole_existing_page() {
        let fast = result(EngineKind::Fast, "f1", 0.6, vec![page(1, "f1", 0.6)]);
        let accurate = result(
            EngineKind::Accurate,
            "a1\n\na2",
            0.6,
            vec![page(1, "a1", 0.5), page(2, "a2", 0.7)],
        );

        let candidates = strategy_candidates(&fast, &accurate, 0.0);
        let aligned = candidates
            .iter()
            .find(|c| c.strategy == FusionStrategy::PageAligned)
            .unwrap();

        assert_eq!(aligned.text, "f1\n\na2");
    }

    #[test]
    fn one_failed_input_passes_the_other_through() {
        let fast = result(EngineKind::Fast, "surviving text", 0.7, vec![]);
        let accurate = failed(EngineKind::Accurate);

        let outcome = fuse(&fast, &accurate).unwrap();
        assert_eq!(outcome.text, "surviving text");
        assert_eq!(outcome.confidence, 0.7);
    }

    #[test]
    fn both_failed_inputs_error() {
        let err = fuse(&failed(EngineKind::Fast), &failed(EngineKind::Accurate)).unwrap_err();
        assert!(matches!(err, RecognitionError::EngineFailure(_)));
    }

    #[test]
    fn degenerate_inputs_fall_back_to_higher_confidence() {
        let fast = result(EngineKind::Fast, "", 0.4, vec![]);
        let accurate = result(EngineKind::Accurate, "", 0.6, vec![]);

        let outcome = fuse(&fast, &accurate).unwrap();
        assert_eq!(outcome.confidence, 0.6);
        assert!(outcome.text.is_empty());
    }

    #[test]
    fn coherence_counts_alphabetic_tokens() {
        assert_eq!(coherence("alpha beta gamma"), 1.0);
        assert_eq!(coherence("123 456"), 0.0);
        assert!((coherence("word 123 !!") - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(coherence(""), 0.0);
    }

    #[test]
    fn scorer_prefers_coherent_candidate() {
        let garbled = FusionCandidate {
            strategy: FusionStrategy::Confidence,
            text: "#### 1234 %%%% 5678".to_string(),
            confidence: 0.6,
            pages: vec![],
        };
        let clean = FusionCandidate {
            strategy: FusionStrategy::Length,
            text: "clear readable words".to_string(),
            confidence: 0.6,
            pages: vec![],
        };
        let max_len = garbled.text.chars().count();
        assert!(quality_score(&clean, max_len) > quality_score(&garbled, max_len));
    }
}
