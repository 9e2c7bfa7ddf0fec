//! Stack trace diagnosis.
//!
//! The generator is asked for a JSON object `{fixable, frames}`. Output that
//! fails validation is answered with a repair instruction in the same
//! conversation, up to [`MAX_PARSE_ATTEMPTS`] generator calls in total.

use crate::error::RemediationError;
use crate::layout::is_valid_unit_name;
use crate::llm::{parse_json_reply, prompts, CompletionOptions, Conversation, Generator};
use crate::util::truncate;
use serde::Serialize;
use serde_json::Value;

/// Generator calls allowed for one diagnosis.
pub const MAX_PARSE_ATTEMPTS: u32 = 3;
const TRACE_PARSE_MAX_TOKENS: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub class: String,
    pub method: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseResult {
    pub fixable: bool,
    pub frames: Vec<Frame>,
}

impl ParseResult {
    /// First frame of a fixable diagnosis; always present once validated.
    pub fn primary_frame(&self) -> Option<&Frame> {
        self.frames.first()
    }
}

/// Outcome of validating one generator response.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Diagnosis {
    Fixable(ParseResult),
    NotFixable(String),
}

pub struct StackTraceAnalyzer<'a> {
    generator: &'a dyn Generator,
}

impl<'a> StackTraceAnalyzer<'a> {
    pub fn new(generator: &'a dyn Generator) -> Self {
        Self { generator }
    }

    pub async fn analyze(
        &self,
        exception_message: &str,
        stack_trace: &str,
    ) -> Result<ParseResult, RemediationError> {
        let mut conversation = Conversation::new(prompts::trace_parse_system());
        conversation.push_user(prompts::trace_parse_user(exception_message, stack_trace));

        let options = CompletionOptions::deterministic(TRACE_PARSE_MAX_TOKENS);
        let mut last_problem = String::new();

        for attempt in 1..=MAX_PARSE_ATTEMPTS {
            let raw = self
                .generator
                .complete(&conversation, options)
                .await
                .map_err(RemediationError::GeneratorFailed)?;
            tracing::debug!(attempt, response = %truncate(raw.trim(), 200), "trace parse response");

            match diagnose(&raw) {
                Ok(Diagnosis::Fixable(result)) => {
                    if let Some(frame) = result.primary_frame() {
                        tracing::info!(class = %frame.class, line = frame.line, frames = result.frames.len(), "diagnosed stack trace");
                    }
                    return Ok(result);
                }
                Ok(Diagnosis::NotFixable(reason)) => {
                    tracing::info!(attempt, %reason, "generator marked exception not fixable");
                    return Err(RemediationError::NotFixable { reason });
                }
                Err(problem) => {
                    tracing::warn!(attempt, %problem, "trace parse attempt failed validation");
                    if attempt < MAX_PARSE_ATTEMPTS {
                        conversation.push_user(prompts::trace_repair(&problem));
                    }
                    last_problem = problem;
                }
            }
        }

        Err(RemediationError::UnparsableTrace {
            attempts: MAX_PARSE_ATTEMPTS,
            reason: last_problem,
        })
    }
}

fn diagnose(raw: &str) -> Result<Diagnosis, String> {
    let value: Value = parse_json_reply(raw.trim())
        .map_err(|e| format!("Invalid JSON: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| "Response is not a JSON object".to_string())?;

    let fixable = match object.get("fixable") {
        None | Some(Value::Null) => return Err("Missing 'fixable' field".to_string()),
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        Some(_) => return Err("'fixable' must be true or false".to_string()),
    };

    if !fixable {
        let reason = object
            .get("reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("generator reported the exception as not fixable")
            .to_string();
        return Ok(Diagnosis::NotFixable(reason));
    }

    let frames = object
        .get("frames")
        .and_then(Value::as_array)
        .ok_or_else(|| "Missing or invalid 'frames' field".to_string())?;
    let (first, rest) = frames
        .split_first()
        .ok_or_else(|| "No frames found in stack trace".to_string())?;

    let primary = parse_frame(first)?;
    let mut parsed = vec![primary];
    for (idx, frame) in rest.iter().enumerate() {
        match parse_frame(frame) {
            Ok(frame) => parsed.push(frame),
            Err(problem) => {
                tracing::debug!(index = idx + 1, %problem, "dropping malformed secondary frame");
            }
        }
    }

    Ok(Diagnosis::Fixable(ParseResult {
        fixable: true,
        frames: parsed,
    }))
}

fn parse_frame(value: &Value) -> Result<Frame, String> {
    let object = value
        .as_object()
        .ok_or_else(|| "Invalid frame structure".to_string())?;

    let class = object
        .get("class")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "Frame missing required field 'class'".to_string())?;
    if !is_valid_unit_name(class) {
        return Err(format!(
            "Frame class '{}' is not a bare Apex class name",
            truncate(class, 80)
        ));
    }

    let line = match object.get("line") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => return Err("Frame missing required field 'line'".to_string()),
    };
    let line = line
        .filter(|l| *l > 0)
        .and_then(|l| u32::try_from(l).ok())
        .ok_or_else(|| "Frame 'line' must be a positive integer".to_string())?;

    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    Ok(Frame {
        class: class.to_string(),
        method,
        line,
    })
}
