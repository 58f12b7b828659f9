use strsim::normalized_levenshtein;

/// Lowercase alphanumeric words joined by single spaces.
pub fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn token_sort(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split(' ').filter(|t| !t.is_empty()).collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Edit-distance ratio in [0.0, 1.0] over normalized text, taking the better of
/// the plain and token-sorted comparisons so word order does not matter.
pub fn text_similarity(s1: &str, s2: &str) -> f32 {
    let a = normalize(s1);
    let b = normalize(s2);

    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let plain = normalized_levenshtein(&a, &b);
    let sorted = normalized_levenshtein(&token_sort(&a), &token_sort(&b));
    plain.max(sorted) as f32
}
