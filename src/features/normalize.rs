//! Text normalization contract (spec §4.1). Pure functions only — no I/O, no
//! dependence on anything but the input string, so the Feature Builder's
//! point-in-time guarantee holds trivially for this step.

/// Merchant-noise tokens stripped after tokenizing. Store numbers
/// (`^#?\d{3,}$`) are filtered separately since they're a pattern, not a
/// fixed word.
const STOP_TOKENS: &[&str] = &[
    "inc", "llc", "ltd", "corp", "co", "the", "and", "of", "store", "#",
];

fn is_store_number(token: &str) -> bool {
    let digits = token.strip_prefix('#').unwrap_or(token);
    digits.len() >= 3 && digits.chars().all(|c| c.is_ascii_digit())
}

/// Lowercase, strip everything but alphanumerics/whitespace/`.`/`/`, collapse
/// whitespace, drop stop-tokens and store numbers, and split into tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '.' || c == '/' {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|tok| !tok.is_empty())
        .filter(|tok| !STOP_TOKENS.contains(tok))
        .filter(|tok| !is_store_number(tok))
        .map(|tok| tok.to_string())
        .collect()
}

/// Concatenation of the first `K<=4` tokens, joined by `_`.
pub fn merchant_canonical(tokens: &[String]) -> String {
    tokens.iter().take(4).cloned().collect::<Vec<_>>().join("_")
}

/// Joined, normalized description (all tokens, space-separated) — stored
/// alongside the token list for display/debugging purposes.
pub fn norm_desc(tokens: &[String]) -> String {
    tokens.join(" ")
}
