pub mod continuation;

pub use continuation::build_continuation_body;

use serde_json::{json, Map, Value};

/// Literal terminator the model is instructed to emit at the very end of its
/// final text. Its presence distinguishes clean completion from truncation.
pub const DONE_SENTINEL: &str = "[done]";

/// System-instruction text appended to every streaming request body.
pub const DONE_INSTRUCTION: &str =
    "Your message must end with [done] to signify the end of your output.";

/// Ensure the request body instructs the model to terminate with the
/// sentinel.
///
/// Appends a text part with [`DONE_INSTRUCTION`] to
/// `systemInstruction.parts`, creating the instruction or repairing a
/// malformed `parts` field as needed. All other fields are left untouched.
pub fn inject_done_instruction(body: &mut Map<String, Value>) {
    let instruction_part = json!({ "text": DONE_INSTRUCTION });

    let Some(system_instruction) = body
        .get_mut("systemInstruction")
        .and_then(Value::as_object_mut)
    else {
        // Missing, null, or not an object: replace wholesale.
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [instruction_part] }),
        );
        return;
    };

    match system_instruction
        .get_mut("parts")
        .and_then(Value::as_array_mut)
    {
        Some(parts) => parts.push(instruction_part),
        None => {
            // parts missing, null, or not a list.
            system_instruction.insert("parts".to_string(), json!([instruction_part]));
        }
    }
}
