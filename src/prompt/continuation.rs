use serde_json::{json, Map, Value};

/// One-line instruction sent as the user turn of a continuation request.
pub const CONTINUATION_INSTRUCTION: &str =
    "Continue exactly where you left off without any preamble or repetition.";

/// Build a continuation request body from the original body and the text
/// forwarded to the client so far.
///
/// The returned body is the original with its `contents` replaced: a
/// two-message history (the partial model answer, then the continuation
/// instruction) is inserted immediately after the last `"user"` message, or
/// appended at the end when no user message exists. The original body is not
/// mutated and remains usable for further retries.
#[must_use]
pub fn build_continuation_body(
    original: &Map<String, Value>,
    accumulated_text: &str,
) -> Map<String, Value> {
    tracing::debug!(
        accumulated_chars = accumulated_text.len(),
        "building continuation request body"
    );

    let mut body = original.clone();

    let contents = original
        .get("contents")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let last_user_index = contents.iter().rposition(|message| {
        message
            .get("role")
            .and_then(Value::as_str)
            .is_some_and(|role| role == "user")
    });

    let history = [
        json!({
            "role": "model",
            "parts": [{ "text": accumulated_text }],
        }),
        json!({
            "role": "user",
            "parts": [{ "text": CONTINUATION_INSTRUCTION }],
        }),
    ];

    let mut new_contents = Vec::with_capacity(contents.len() + history.len());
    match last_user_index {
        Some(index) => {
            new_contents.extend(contents[..=index].iter().cloned());
            new_contents.extend(history);
            new_contents.extend(contents[index + 1..].iter().cloned());
        }
        None => {
            new_contents.extend(contents);
            new_contents.extend(history);
        }
    }

    body.insert("contents".to_string(), Value::Array(new_contents));
    body
}
