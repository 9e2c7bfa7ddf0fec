//! Pulls the JSON object out of a generator reply.
//!
//! Replies should be a bare object but arrive inside a markdown fence, after a
//! line of prose, or wrapped in a second pair of braces.

use crate::util::sanitize_error_body;
use anyhow::anyhow;

/// Objects scanned out of surrounding prose before giving up.
const MAX_EMBEDDED_OBJECTS: usize = 4;

/// Deserialize the first plausible object in `reply`.
pub fn parse_json_reply<T>(reply: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let trimmed = reply.trim();
    // A reply that opens with an object is taken as-is; fences inside it belong
    // to source text.
    let body = if trimmed.starts_with('{') {
        trimmed
    } else {
        fenced_body(trimmed).unwrap_or(trimmed)
    };

    let mut first_err = None;
    for candidate in reply_candidates(body) {
        match serde_json::from_str::<T>(candidate) {
            Ok(value) => return Ok(value),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }

    let began = sanitize_error_body(reply);
    Err(match first_err {
        Some(err) => anyhow!("{} (response began: {})", err, began),
        None => anyhow!("response contained no JSON object (response began: {})", began),
    })
}

/// Text between the first fence and its closing fence, info string dropped.
fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n').map_or(after_open.len(), |i| i + 1);
    let body = &after_open[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    Some(body.trim())
}

/// Ordered parse attempts: the whole body, the body with doubled outer braces
/// removed, then each top-level object embedded in it.
fn reply_candidates(body: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    push_candidate(&mut candidates, body);
    if let Some(inner) = doubled_braces_inner(body) {
        push_candidate(&mut candidates, inner);
    }

    let mut found = 0;
    let mut pos = 0;
    while found < MAX_EMBEDDED_OBJECTS {
        let Some(offset) = body[pos..].find('{') else {
            break;
        };
        let start = pos + offset;
        match object_end(body, start) {
            Some(end) => {
                push_candidate(&mut candidates, &body[start..end]);
                found += 1;
                pos = end;
            }
            None => pos = start + 1,
        }
    }
    candidates
}

fn push_candidate<'a>(candidates: &mut Vec<&'a str>, candidate: &'a str) {
    let candidate = candidate.trim();
    if !candidate.is_empty() && !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

/// `{ {"a": 1} }` → `{"a": 1}`.
fn doubled_braces_inner(body: &str) -> Option<&str> {
    let inner = body.strip_prefix('{')?.strip_suffix('}')?.trim();
    inner.starts_with('{').then_some(inner)
}

/// Byte index one past the bracket closing the object opened at `start`.
fn object_end(text: &str, start: usize) -> Option<usize> {
    let mut expected: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => expected.push('}'),
            '[' => expected.push(']'),
            '}' | ']' => {
                if expected.pop() != Some(ch) {
                    return None;
                }
                if expected.is_empty() {
                    return Some(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
