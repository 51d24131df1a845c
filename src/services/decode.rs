use crate::services::error::AgentError;
use serde::de::DeserializeOwned;

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Returns the first balanced `{...}` or `[...]` span, ignoring delimiters
/// inside string literals.
pub fn find_balanced_span(s: &str) -> Option<&str> {
    let start = s.find(|c: char| c == '{' || c == '[')?;
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&s[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decodes free-form model output into `T`.
///
/// Tries, in order: the text with code fences stripped, then the first
/// balanced JSON object or array found anywhere in the text.
pub fn extract_json<T: DeserializeOwned>(raw: &str, context: &str) -> Result<T, AgentError> {
    let cleaned = strip_code_blocks(raw);
    if cleaned.is_empty() {
        return Err(AgentError::empty(context));
    }

    let direct_err = match serde_json::from_str::<T>(&cleaned) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(span) = find_balanced_span(&cleaned) {
        if span.len() != cleaned.len() {
            return serde_json::from_str::<T>(span)
                .map_err(|e| AgentError::schema(context, e.to_string()));
        }
    }

    let preview: String = cleaned.chars().take(200).collect();
    Err(AgentError::schema(
        context,
        format!("{} (response starts with: {:?})", direct_err, preview),
    ))
}
