//! Approximate token accounting and budget truncation.
//!
//! No tokenizer is bundled, so every model uses the four characters per token
//! heuristic. Counts are character based, never byte based.

/// Characters assumed per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Appended to any text cut down to fit a budget.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Fraction of the proportional budget kept, leaving room for estimation error.
const SAFETY_MARGIN: f64 = 0.9;

/// Estimates the token cost of `text` for `model`.
#[must_use]
pub fn count_tokens(text: &str, _model: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Cuts `text` from the end so that it fits `max_tokens` for `model`.
///
/// Text already within budget is returned unchanged. Otherwise the kept prefix
/// is proportional to `max_tokens / tokens` with a 10% margin and the result
/// always ends with [`TRUNCATION_MARKER`]. The start of the text is never
/// dropped.
///
/// The result is strictly shorter than the input only when the input is longer
/// than the marker. Shorter over-budget input comes back as the marker alone.
#[must_use]
pub fn truncate_context(text: &str, max_tokens: usize, model: &str) -> String {
    let tokens = count_tokens(text, model);
    if tokens <= max_tokens {
        return text.to_string();
    }

    let chars = text.chars().count();
    let marker_chars = TRUNCATION_MARKER.chars().count();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let proportional = (chars as f64 * (max_tokens as f64 / tokens as f64) * SAFETY_MARGIN) as usize;
    let keep = proportional.min(chars.saturating_sub(marker_chars + 1));

    let end = text.char_indices().nth(keep).map_or(text.len(), |(idx, _)| idx);
    let mut truncated = String::with_capacity(end + TRUNCATION_MARKER.len());
    truncated.push_str(&text[..end]);
    truncated.push_str(TRUNCATION_MARKER);

    tracing::debug!(
        model,
        tokens,
        max_tokens,
        kept_chars = keep,
        "Truncated context to fit token budget"
    );
    truncated
}
