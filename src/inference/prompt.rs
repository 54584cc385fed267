//! Temporal context prompt construction

use std::borrow::Cow;

/// Characters kept from each previous response
pub const CONTEXT_ENTRY_CHARS: usize = 150;

const ELLIPSIS: &str = "...";

/// Shorten a response to [`CONTEXT_ENTRY_CHARS`] characters plus an ellipsis
pub fn truncate_entry(text: &str) -> Cow<'_, str> {
    match text.char_indices().nth(CONTEXT_ENTRY_CHARS) {
        Some((cut, _)) => Cow::Owned(format!("{}{ELLIPSIS}", &text[..cut])),
        None => Cow::Borrowed(text),
    }
}

/// Prepend previous responses to `base`.
///
/// `recent` is newest first. With no history the base prompt is returned
/// verbatim.
pub fn build_contextual_prompt(base: &str, recent: &[String]) -> String {
    if recent.is_empty() {
        return base.to_string();
    }

    let context = recent
        .iter()
        .enumerate()
        .map(|(i, response)| format!("  {} frame(s) ago: {}", i + 1, truncate_entry(response)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{base}\n\n[Previous Frame Context]\n{context}\n\n[Current Frame Analysis]\n\
         Based on the above context, analyze the current frame and describe any changes or \
         continuation of actions."
    )
}
