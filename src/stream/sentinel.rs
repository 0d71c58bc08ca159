use std::borrow::Cow;

use serde_json::Value;

use crate::prompt::DONE_SENTINEL;
use crate::stream::classifier::is_data_line;

/// Strip a trailing `[done]` sentinel (or any split prefix of it) from the
/// text of a terminal data line.
///
/// Only lines whose finish reason the engine accepted as final are edited
/// (`is_terminal_line`). The JSON payload is reparsed and reserialized; the
/// raw bytes before the first `{` are preserved. Any failure to parse or
/// navigate leaves the line unchanged.
#[must_use]
pub fn remove_done_token_from_line(line: &str, is_terminal_line: bool) -> Cow<'_, str> {
    if !is_data_line(line) || !is_terminal_line {
        return Cow::Borrowed(line);
    }

    let Some(brace) = line.find('{') else {
        return Cow::Borrowed(line);
    };
    let Ok(mut payload) = serde_json::from_str::<Value>(&line[brace..]) else {
        tracing::debug!("failed to parse terminal line for sentinel removal");
        return Cow::Borrowed(line);
    };

    let Some(part) = payload
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("content"))
        .and_then(|c| c.get_mut("parts"))
        .and_then(|p| p.get_mut(0))
        .and_then(Value::as_object_mut)
    else {
        return Cow::Borrowed(line);
    };

    if part
        .get("thought")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Cow::Borrowed(line);
    }
    let Some(text) = part.get("text").and_then(Value::as_str) else {
        return Cow::Borrowed(line);
    };

    let trimmed = text.trim();
    let Some(stripped) = strip_done_suffix(trimmed) else {
        return Cow::Borrowed(line);
    };

    tracing::debug!(
        original_len = trimmed.len(),
        modified_len = stripped.len(),
        "removed sentinel suffix from terminal text chunk"
    );
    let stripped = stripped.to_string();
    part.insert("text".to_string(), Value::String(stripped));

    let Ok(serialized) = serde_json::to_string(&payload) else {
        return Cow::Borrowed(line);
    };
    let mut out = String::with_capacity(brace + serialized.len());
    out.push_str(&line[..brace]);
    out.push_str(&serialized);
    Cow::Owned(out)
}

/// Remove the longest suffix of the sentinel present at the end of `text`.
///
/// Checking every suffix of `[done]` (longest first) handles the sentinel
/// being split across chunks, where earlier chunks carried its head.
fn strip_done_suffix(text: &str) -> Option<&str> {
    for start in 0..DONE_SENTINEL.len() {
        let suffix = &DONE_SENTINEL[start..];
        if let Some(stripped) = text.strip_suffix(suffix) {
            return Some(stripped);
        }
    }
    None
}
