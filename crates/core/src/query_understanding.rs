//! Query understanding (spec §4.6): normalization, intent/difficulty
//! classification, strategy selection, and query expansion.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Navigational,
    Factual,
    Exploratory,
    Analytical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    SparseOnly,
    DenseOnly,
    HybridBalanced,
    HybridSparseHeavy,
    HybridDenseHeavy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Signals {
    pub word_count: usize,
    pub has_camel_case: bool,
    pub has_snake_case: bool,
    pub has_path_like: bool,
    pub has_question_word: bool,
    pub has_comparison_phrase: bool,
    pub specificity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub normalized: String,
    pub intent: Intent,
    pub difficulty: Difficulty,
    pub strategy: Strategy,
    pub signals: Signals,
    pub confidence: f64,
}

const QUESTION_WORDS: &[&str] = &["what", "why", "how", "when", "where", "which", "who"];
const COMPARISON_PHRASES: &[&str] = &["vs", "versus", "compare", "difference between"];
const EXPLORATORY_PHRASES: &[&str] = &["how does", "explain", "architecture", "flow", "overview", "work"];
const KNOWN_EXTENSIONS: &[&str] =
    &[".rs", ".go", ".py", ".js", ".ts", ".tsx", ".jsx", ".java", ".c", ".h", ".cpp", ".hpp"];

pub fn normalize(query: &str) -> String {
    let lowered = query.to_lowercase();
    let stripped: String = lowered.chars().filter(|c| !c.is_control()).collect();
    let collapsed: Vec<&str> = stripped.split_whitespace().collect();
    let mut joined = collapsed.join(" ");
    joined.truncate(10_000);
    joined
}

fn is_camel_case(token: &str) -> bool {
    let has_upper = token.chars().any(|c| c.is_uppercase());
    let has_lower = token.chars().any(|c| c.is_lowercase());
    has_upper && has_lower && !token.contains('_') && !token.contains('-')
}

fn is_snake_case(token: &str) -> bool {
    token.contains('_') && token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn has_path_like_tokens(query: &str) -> bool {
    query.contains('/') || KNOWN_EXTENSIONS.iter().any(|ext| query.contains(ext))
}

fn compute_signals(raw: &str, normalized: &str) -> Signals {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let word_count = tokens.len();
    let has_camel_case = tokens.iter().any(|t| is_camel_case(t));
    let has_snake_case = tokens.iter().any(|t| is_snake_case(t));
    let has_path_like = has_path_like_tokens(raw);
    let has_question_word = tokens.first().map(|t| QUESTION_WORDS.contains(t)).unwrap_or(false)
        || QUESTION_WORDS.iter().any(|qw| tokens.contains(qw));
    let has_comparison_phrase = COMPARISON_PHRASES.iter().any(|p| normalized.contains(p));

    // Specificity: rarer, more identifier-shaped tokens score higher.
    let identifier_tokens = tokens.iter().filter(|t| is_camel_case(t) || is_snake_case(t) || has_path_like_tokens(t)).count();
    let avg_len: f64 = if tokens.is_empty() {
        0.0
    } else {
        tokens.iter().map(|t| t.len()).sum::<usize>() as f64 / tokens.len() as f64
    };
    let length_component = (avg_len / 12.0).min(1.0);
    let identifier_component = if tokens.is_empty() { 0.0 } else { identifier_tokens as f64 / tokens.len() as f64 };
    let specificity = (0.5 * length_component + 0.5 * identifier_component).clamp(0.0, 1.0);

    Signals { word_count, has_camel_case, has_snake_case, has_path_like, has_question_word, has_comparison_phrase, specificity }
}

fn classify_intent(normalized: &str, signals: &Signals) -> Intent {
    let single_camel_token = signals.word_count == 1 && signals.has_camel_case;
    if signals.has_path_like || single_camel_token {
        return Intent::Navigational;
    }
    if signals.has_comparison_phrase {
        return Intent::Analytical;
    }
    if signals.has_question_word && signals.specificity >= 0.5 {
        return Intent::Factual;
    }
    let has_exploratory_phrase = EXPLORATORY_PHRASES.iter().any(|p| normalized.contains(p));
    if has_exploratory_phrase || (signals.word_count >= 5 && signals.specificity < 0.5) {
        return Intent::Exploratory;
    }
    if signals.word_count <= 4 {
        Intent::Factual
    } else {
        Intent::Exploratory
    }
}

fn classify_difficulty(intent: Intent, signals: &Signals) -> Difficulty {
    match intent {
        Intent::Navigational => Difficulty::Easy,
        Intent::Analytical => Difficulty::Hard,
        Intent::Factual => {
            if signals.specificity >= 0.7 {
                Difficulty::Easy
            } else if signals.specificity >= 0.4 {
                Difficulty::Medium
            } else {
                Difficulty::Hard
            }
        }
        Intent::Exploratory => {
            let has_exploratory_phrase = signals.word_count >= 5;
            if has_exploratory_phrase && signals.word_count >= 8 {
                Difficulty::Hard
            } else if has_exploratory_phrase {
                Difficulty::Medium
            } else {
                Difficulty::Easy
            }
        }
    }
}

fn choose_strategy(intent: Intent) -> Strategy {
    match intent {
        Intent::Navigational => Strategy::HybridSparseHeavy,
        Intent::Exploratory => Strategy::HybridDenseHeavy,
        Intent::Factual | Intent::Analytical => Strategy::HybridBalanced,
    }
}

fn confidence_for(intent: Intent, signals: &Signals) -> f64 {
    match intent {
        Intent::Navigational => 0.9,
        Intent::Analytical => 0.75,
        Intent::Factual => 0.5 + 0.4 * signals.specificity,
        Intent::Exploratory => 0.6,
    }
}

pub fn understand(query: &str) -> QueryAnalysis {
    let normalized = normalize(query);
    let signals = compute_signals(query, &normalized);
    let intent = classify_intent(&normalized, &signals);
    let difficulty = classify_difficulty(intent, &signals);
    let strategy = choose_strategy(intent);
    let confidence = confidence_for(intent, &signals);
    QueryAnalysis { normalized, intent, difficulty, strategy, signals, confidence }
}

/// Code-abbreviation expansion table used by BM25-path query expansion.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("cfg", "config"),
    ("impl", "implementation"),
    ("db", "database"),
    ("auth", "authentication"),
    ("req", "request"),
    ("resp", "response"),
    ("ctx", "context"),
    ("fn", "function"),
    ("err", "error"),
    ("init", "initialize"),
    ("repo", "repository"),
];

fn split_camel_case(token: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for c in token.chars() {
        if c.is_uppercase() && !current.is_empty() {
            parts.push(std::mem::take(&mut current).to_lowercase());
        }
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current.to_lowercase());
    }
    parts
}

fn split_identifier(token: &str) -> Vec<String> {
    token
        .split(|c| c == '_' || c == '-')
        .flat_map(split_camel_case)
        .filter(|s| !s.is_empty())
        .collect()
}

/// A token with its boost weight; weight >= 0.8 is emitted twice upstream,
/// >= 0.6 once, per spec §4.6.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedToken {
    pub token: String,
    pub weight: f64,
}

/// Expands a normalized query for the BM25/sparse path: identifier
/// splitting plus abbreviation expansion, emitted as a weighted token stream.
pub fn expand_sparse(normalized: &str) -> Vec<WeightedToken> {
    let mut out = Vec::new();
    for raw in normalized.split_whitespace() {
        out.push(WeightedToken { token: raw.to_string(), weight: 1.0 });
        let parts = split_identifier(raw);
        if parts.len() > 1 {
            for part in &parts {
                out.push(WeightedToken { token: part.clone(), weight: 0.7 });
            }
        }
        for (short, long) in ABBREVIATIONS {
            if raw == *short || parts.iter().any(|p| p == short) {
                out.push(WeightedToken { token: long.to_string(), weight: 0.8 });
            }
        }
    }
    out
}

/// Flattens a weighted token stream into a repeated-term string for sparse
/// encoders that consume plain text (weight >= 0.8 repeats twice, >= 0.6 once).
pub fn flatten_weighted_tokens(tokens: &[WeightedToken]) -> String {
    let mut out = Vec::new();
    for t in tokens {
        out.push(t.token.clone());
        if t.weight >= 0.8 {
            out.push(t.token.clone());
            out.push(t.token.clone());
        } else if t.weight >= 0.6 {
            out.push(t.token.clone());
        }
    }
    out.join(" ")
}

/// Expands a normalized query for the dense path: "`original (related: a, b, c)`".
pub fn expand_dense(normalized: &str) -> String {
    let related: Vec<String> = split_identifier(normalized)
        .into_iter()
        .chain(normalized.split_whitespace().flat_map(|t| {
            ABBREVIATIONS.iter().find(|(short, _)| *short == t).map(|(_, long)| long.to_string())
        }))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .take(5)
        .collect();
    if related.is_empty() {
        normalized.to_string()
    } else {
        format!("{normalized} (related: {})", related.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigational_on_path_like_query() {
        let a = understand("src/index.rs");
        assert_eq!(a.intent, Intent::Navigational);
        assert_eq!(a.difficulty, Difficulty::Easy);
    }

    #[test]
    fn navigational_on_single_camel_token() {
        let a = understand("HttpClient");
        assert_eq!(a.intent, Intent::Navigational);
    }

    #[test]
    fn analytical_on_comparison_phrase() {
        let a = understand("difference between mutex and rwlock");
        assert_eq!(a.intent, Intent::Analytical);
        assert_eq!(a.difficulty, Difficulty::Hard);
    }

    #[test]
    fn exploratory_on_architecture_phrase() {
        let a = understand("explain the architecture of the indexing pipeline");
        assert_eq!(a.intent, Intent::Exploratory);
    }

    #[test]
    fn factual_short_query_falls_through() {
        let a = understand("parse json");
        assert_eq!(a.intent, Intent::Factual);
    }

    #[test]
    fn sparse_expansion_splits_identifiers() {
        let tokens = expand_sparse("httpclient_request");
        assert!(tokens.iter().any(|t| t.token == "request"));
    }

    #[test]
    fn dense_expansion_wraps_related() {
        let expanded = expand_dense("db cfg");
        assert!(expanded.starts_with("db cfg (related:"));
    }

    #[test]
    fn flatten_weights_tiers_repetition_by_weight() {
        let high = flatten_weighted_tokens(&[WeightedToken { token: "auth".to_string(), weight: 0.8 }]);
        let mid = flatten_weighted_tokens(&[WeightedToken { token: "auth".to_string(), weight: 0.6 }]);
        let low = flatten_weighted_tokens(&[WeightedToken { token: "auth".to_string(), weight: 0.3 }]);
        assert_eq!(high.split_whitespace().count(), 3);
        assert_eq!(mid.split_whitespace().count(), 2);
        assert_eq!(low.split_whitespace().count(), 1);
        assert_ne!(high, mid);
    }
}
