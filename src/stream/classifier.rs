use serde_json::Value;

const DATA_PREFIX: &str = "data: ";
const BLOCK_MARKER: &str = "blockReason";

/// Structured view of one SSE data line.
///
/// Every field degrades to its default when the corresponding piece of the
/// payload is absent or has the wrong shape; classification never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRecord {
    /// Text fragment from the first part of the first candidate.
    pub text: String,
    /// Whether the first part carries a truthy thought marker.
    pub is_thought: bool,
    /// Finish reason code from the first candidate, empty if absent.
    pub finish_reason: String,
    /// Whether the raw line contains a block-reason indicator.
    pub is_blocked: bool,
}

impl LineRecord {
    #[inline]
    #[must_use]
    pub fn has_finish_reason(&self) -> bool {
        !self.finish_reason.is_empty()
    }

    /// STOP and MAX_TOKENS are the only finish reasons accepted as final.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.finish_reason.as_str(), "STOP" | "MAX_TOKENS")
    }
}

/// Check whether a line is an SSE data line.
#[inline]
#[must_use]
pub fn is_data_line(line: &str) -> bool {
    line.starts_with(DATA_PREFIX)
}

/// Classify one SSE line into a [`LineRecord`].
///
/// Non-data lines yield an all-default record. For data lines, the JSON
/// object starting at the first `{` is parsed and
/// `candidates[0].content.parts[0].{text,thought}` and
/// `candidates[0].finishReason` are extracted; the block marker is a plain
/// substring probe over the raw line, since it can surface in several schema
/// positions.
#[must_use]
pub fn classify_line(line: &str) -> LineRecord {
    if !is_data_line(line) {
        return LineRecord::default();
    }

    let mut record = LineRecord {
        is_blocked: memchr::memmem::find(line.as_bytes(), BLOCK_MARKER.as_bytes()).is_some(),
        ..LineRecord::default()
    };

    let Some(brace) = line.find('{') else {
        return record;
    };
    let Ok(payload) = serde_json::from_str::<Value>(&line[brace..]) else {
        tracing::debug!("failed to parse content from data line");
        return record;
    };

    let candidate = payload.get("candidates").and_then(|c| c.get(0));

    if let Some(reason) = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
    {
        record.finish_reason = reason.to_string();
    }

    let part = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0));

    if let Some(part) = part {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            record.text = text.to_string();
        }
        record.is_thought = part
            .get("thought")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    }

    record
}
