//! Fuzzy tool-name matching for lookup misses.
//!
//! Two knobs matter here. A lookup miss auto-resolves to a candidate only
//! when the normalized Levenshtein similarity clears [`AUTO_RESOLVE_THRESHOLD`]
//! (typo-level closeness; substring overlap alone is never enough to execute
//! someone else's tool). Suggestion ranking is looser: it combines substring
//! containment, shared `_`-separated segments, and edit distance, keeping
//! candidates above [`SUGGESTION_FLOOR`].

/// Minimum normalized similarity for an exact-miss to resolve to a candidate.
pub const AUTO_RESOLVE_THRESHOLD: f64 = 0.8;

/// Minimum combined score for a name to appear in suggestions.
pub const SUGGESTION_FLOOR: f64 = 0.3;

/// Edit similarity below this contributes nothing to suggestion scores.
/// Long unrelated names share enough incidental characters to score ~0.3
/// on edit distance alone; without the gate they would pollute suggestions.
const EDIT_SCORE_MIN: f64 = 0.55;

/// Maximum number of suggestions returned to the client.
pub const MAX_SUGGESTIONS: usize = 5;

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized edit similarity in `[0, 1]` (1.0 = identical).
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Combined suggestion score for `candidate` against `query`.
fn suggestion_score(query: &str, candidate: &str) -> f64 {
    let q = query.to_lowercase();
    let c = candidate.to_lowercase();

    let substring = if !q.is_empty() && (c.contains(&q) || q.contains(&c)) {
        let min_len = q.len().min(c.len()) as f64;
        let max_len = q.len().max(c.len()) as f64;
        0.5 + 0.5 * (min_len / max_len)
    } else {
        0.0
    };

    let q_segs: Vec<&str> = q.split('_').filter(|s| !s.is_empty()).collect();
    let c_segs: Vec<&str> = c.split('_').filter(|s| !s.is_empty()).collect();
    let segments = if q_segs.is_empty() || c_segs.is_empty() {
        0.0
    } else {
        let common = q_segs.iter().filter(|s| c_segs.contains(s)).count() as f64;
        0.85 * common / q_segs.len().max(c_segs.len()) as f64
    };

    let edit = similarity(&q, &c);
    let edit = if edit >= EDIT_SCORE_MIN { edit } else { 0.0 };

    substring.max(segments).max(edit)
}

/// Rank `names` against `query`, returning up to `max` suggestions.
///
/// Ties break toward the shorter name, then lexicographically.
pub fn suggest(query: &str, names: &[String], max: usize) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = names
        .iter()
        .map(|n| (suggestion_score(query, n), n))
        .filter(|(score, _)| *score >= SUGGESTION_FLOOR)
        .collect();
    scored.sort_by(|(sa, na), (sb, nb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| na.len().cmp(&nb.len()))
            .then_with(|| na.cmp(nb))
    });
    scored.into_iter().take(max).map(|(_, n)| n.clone()).collect()
}

/// Pick the best auto-resolve candidate for `query`, if any clears the
/// similarity threshold.
pub fn best_match<'a>(query: &str, names: &'a [String]) -> Option<&'a String> {
    let mut best: Option<(f64, &String)> = None;
    for name in names {
        let score = similarity(query, name);
        if score < AUTO_RESOLVE_THRESHOLD {
            continue;
        }
        let better = match best {
            None => true,
            Some((bs, bn)) => {
                score > bs
                    || (score == bs
                        && (name.len() < bn.len() || (name.len() == bn.len() && name < bn)))
            }
        };
        if better {
            best = Some((score, name));
        }
    }
    best.map(|(_, n)| n)
}
