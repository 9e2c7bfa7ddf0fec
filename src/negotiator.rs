//! Multi-turn fix negotiation.
//!
//! Each generator reply is classified as a request for one more class, a fix
//! proposal, a refusal, or garbage. Requests are served through the run's
//! [`SourceResolver`]; proposals are validated into a [`FixSet`].

use crate::error::RemediationError;
use crate::layout::is_valid_unit_name;
use crate::llm::prompts::{self, NEED_MORE_SENTINEL, NOT_FIXABLE_SENTINEL};
use crate::llm::{parse_json_reply, CompletionOptions, Conversation, Generator};
use crate::source::SourceResolver;
use crate::util::truncate;
use serde_json::{Map, Value};

/// Generator calls allowed for one negotiation.
pub const MAX_NEGOTIATION_TURNS: u32 = 5;
const FIX_MAX_TOKENS: u32 = 4096;

/// Exception details shown to the generator in the opening message.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionContext<'a> {
    pub message: &'a str,
    pub stack_trace: &'a str,
    pub error_line: u32,
}

/// A classified generator reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    RequestUnit(String),
    ProposeFix(Map<String, Value>),
    NotFixable(String),
    Malformed(String),
}

pub fn classify_reply(raw: &str) -> Reply {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Reply::Malformed("Empty response".to_string());
    }

    // Sentinel lines only count outside of structured output; fixed sources
    // could contain anything.
    if !is_structured(trimmed) {
        if let Some(reply) = sentinel_reply(trimmed) {
            return reply;
        }
    }

    match parse_json_reply::<Value>(trimmed) {
        Ok(Value::Object(map)) => Reply::ProposeFix(map),
        Ok(_) => Reply::Malformed("Response is not a JSON object".to_string()),
        Err(err) => Reply::Malformed(format!("Invalid JSON: {}", err)),
    }
}

/// A bare object, or a fenced block whose body opens an object.
fn is_structured(text: &str) -> bool {
    if text.starts_with('{') {
        return true;
    }
    match text.strip_prefix("```") {
        Some(rest) => {
            let body = rest.split_once('\n').map_or("", |(_, body)| body);
            body.trim_start().starts_with('{')
        }
        None => false,
    }
}

fn sentinel_reply(text: &str) -> Option<Reply> {
    for line in text.lines() {
        let line = line.trim().trim_matches(|c| c == '*' || c == '`');
        if let Some(rest) = strip_prefix_ignore_case(line, NEED_MORE_SENTINEL) {
            return Some(unit_request(rest));
        }
        if let Some(rest) = strip_prefix_ignore_case(line, NOT_FIXABLE_SENTINEL) {
            let reason = rest.trim();
            let reason = if reason.is_empty() {
                "generator declined to produce a fix"
            } else {
                reason
            };
            return Some(Reply::NotFixable(reason.to_string()));
        }
    }
    None
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn unit_request(rest: &str) -> Reply {
    let name = rest.trim().trim_end_matches(|c| c == '.' || c == ',');
    if name.is_empty() {
        return Reply::Malformed(format!("{} without a class name", NEED_MORE_SENTINEL));
    }
    if name.contains(|c: char| c == ',' || c.is_whitespace()) {
        return Reply::Malformed(format!(
            "Request exactly one class per reply (got '{}')",
            truncate(name, 80)
        ));
    }
    Reply::RequestUnit(name.to_string())
}

/// Validated fix: full replacement source per class, primary class first and
/// the rest in name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixSet {
    entries: Vec<(String, String)>,
}

impl FixSet {
    pub fn from_proposal(proposal: Map<String, Value>, primary: &str) -> Result<Self, String> {
        if proposal.is_empty() {
            return Err("Empty JSON response".to_string());
        }
        if !proposal.contains_key(primary) {
            return Err(format!("Primary class {} not found in fix response", primary));
        }

        let mut primary_entry = None;
        let mut others = Vec::with_capacity(proposal.len().saturating_sub(1));
        for (unit, value) in proposal {
            if !is_valid_unit_name(&unit) {
                return Err(format!("'{}' is not a valid class name", truncate(&unit, 80)));
            }
            let content = match value {
                Value::String(s) if !s.trim().is_empty() => s,
                _ => return Err(format!("Invalid or empty content for class {}", unit)),
            };
            if unit == primary {
                primary_entry = Some((unit, content));
            } else {
                others.push((unit, content));
            }
        }

        let primary_entry = primary_entry
            .ok_or_else(|| format!("Primary class {} not found in fix response", primary))?;
        others.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::with_capacity(others.len() + 1);
        entries.push(primary_entry);
        entries.extend(others);
        Ok(Self { entries })
    }

    pub fn primary(&self) -> &str {
        &self.entries[0].0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(u, c)| (u.as_str(), c.as_str()))
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(u, _)| u.as_str()).collect()
    }
}

pub struct FixNegotiator<'a> {
    generator: &'a dyn Generator,
    resolver: &'a mut SourceResolver,
}

impl<'a> FixNegotiator<'a> {
    pub fn new(generator: &'a dyn Generator, resolver: &'a mut SourceResolver) -> Self {
        Self {
            generator,
            resolver,
        }
    }

    pub async fn negotiate(
        &mut self,
        primary_unit: &str,
        primary_source: &str,
        exception: &ExceptionContext<'_>,
    ) -> Result<FixSet, RemediationError> {
        let mut conversation = Conversation::new(prompts::fix_negotiation_system());
        conversation.push_user(prompts::fix_negotiation_opening(
            exception.message,
            exception.error_line,
            exception.stack_trace,
            primary_unit,
            primary_source,
        ));

        let options = CompletionOptions::deterministic(FIX_MAX_TOKENS);
        let mut last_problem = "no usable reply".to_string();

        for turn in 1..=MAX_NEGOTIATION_TURNS {
            let raw = self
                .generator
                .complete(&conversation, options)
                .await
                .map_err(RemediationError::GeneratorFailed)?;
            conversation.push_assistant(raw.as_str());
            let final_turn = turn == MAX_NEGOTIATION_TURNS;

            match classify_reply(&raw) {
                Reply::ProposeFix(proposal) => match FixSet::from_proposal(proposal, primary_unit) {
                    Ok(fix_set) => {
                        tracing::info!(turn, classes = ?fix_set.unit_names(), "fix proposal accepted");
                        return Ok(fix_set);
                    }
                    Err(problem) => {
                        tracing::warn!(turn, %problem, "fix proposal rejected");
                        if !final_turn {
                            conversation.push_user(prompts::fix_repair(&problem));
                        }
                        last_problem = problem;
                    }
                },
                Reply::RequestUnit(unit) => {
                    tracing::info!(turn, %unit, "generator requested another class");
                    last_problem = format!("still requesting classes ({}) when turns ran out", unit);
                    if !final_turn {
                        let notice = self.serve_request(&unit).await;
                        conversation.push_user(notice);
                    }
                }
                Reply::NotFixable(reason) => {
                    tracing::info!(turn, %reason, "generator declared the exception not fixable");
                    return Err(RemediationError::NotFixable { reason });
                }
                Reply::Malformed(problem) => {
                    tracing::warn!(turn, %problem, "malformed negotiation reply");
                    if !final_turn {
                        conversation.push_user(prompts::fix_repair(&problem));
                    }
                    last_problem = problem;
                }
            }
        }

        Err(RemediationError::NegotiationExhausted {
            turns: MAX_NEGOTIATION_TURNS,
            last_problem,
        })
    }

    /// Fetch a requested class and phrase the follow-up message. Fetch
    /// failures are reported to the generator, never to the caller.
    async fn serve_request(&mut self, unit: &str) -> String {
        let already_provided = self.resolver.is_cached(unit);
        let unit_name = self
            .resolver
            .canonical_name(unit)
            .unwrap_or_else(|_| unit.to_string());

        match self.resolver.fetch(unit).await {
            Ok(source) => {
                let available = self.resolver.fetched_units();
                if already_provided {
                    prompts::unit_already_provided(&unit_name, &source, available)
                } else {
                    prompts::unit_provided(&unit_name, &source, available)
                }
            }
            Err(err) => {
                tracing::warn!(unit = %unit_name, error = %err, "requested class unavailable");
                prompts::unit_unavailable(&unit_name, &err.to_string(), self.resolver.fetched_units())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::UnitLayout;
    use crate::llm::Role;
    use crate::testing::{FakeSourceReader, ScriptedGenerator};
    use std::sync::Arc;

    const PRIMARY_SOURCE: &str = "public class Foo { }";

    fn exception() -> ExceptionContext<'static> {
        ExceptionContext {
            message: "System.NullPointerException",
            stack_trace: "Class.Foo.bar: line 10, column 1",
            error_line: 10,
        }
    }

    fn proposal(raw: &str) -> Map<String, Value> {
        match classify_reply(raw) {
            Reply::ProposeFix(map) => map,
            other => panic!("expected a proposal, got {:?}", other),
        }
    }

    async fn resolver_with(reader: &Arc<FakeSourceReader>) -> SourceResolver {
        let mut resolver = SourceResolver::new(reader.clone(), UnitLayout::default(), "main");
        resolver.fetch("Foo").await.unwrap();
        resolver
    }

    #[test]
    fn test_classify_need_more_after_prose() {
        let raw = "I need to see the selector first.\nNEED_MORE: AccountSelector";
        assert_eq!(classify_reply(raw), Reply::RequestUnit("AccountSelector".to_string()));
    }

    #[test]
    fn test_classify_need_more_rejects_multiple_names() {
        assert!(matches!(
            classify_reply("NEED_MORE: Foo, Bar"),
            Reply::Malformed(ref p) if p.contains("exactly one class")
        ));
        assert!(matches!(classify_reply("NEED_MORE:"), Reply::Malformed(_)));
    }

    #[test]
    fn test_classify_not_fixable_and_garbage() {
        assert_eq!(
            classify_reply("NOT_FIXABLE: governor limit in managed package"),
            Reply::NotFixable("governor limit in managed package".to_string())
        );
        assert!(matches!(classify_reply("   "), Reply::Malformed(_)));
        assert!(matches!(classify_reply("let me think"), Reply::Malformed(_)));
        assert!(matches!(classify_reply("[\"Foo\"]"), Reply::Malformed(_)));
    }

    #[test]
    fn test_sentinel_inside_fix_source_is_not_a_request() {
        let raw = r#"{"Foo": "// NEED_MORE: Bar\npublic class Foo {}"}"#;
        assert!(matches!(classify_reply(raw), Reply::ProposeFix(_)));

        let fenced = "```json\n{\"Foo\": \"// NEED_MORE: Bar\"}\n```";
        assert!(matches!(classify_reply(fenced), Reply::ProposeFix(_)));
    }

    #[test]
    fn test_classify_fenced_sentinels() {
        assert_eq!(
            classify_reply("```\nNEED_MORE: Bar\n```"),
            Reply::RequestUnit("Bar".to_string())
        );
        assert_eq!(
            classify_reply("```text\nNOT_FIXABLE: managed package\n```"),
            Reply::NotFixable("managed package".to_string())
        );
    }

    #[test]
    fn test_fix_set_orders_primary_first_then_by_name() {
        let fix = FixSet::from_proposal(
            proposal(r#"{"Zeta": "z", "Alpha": "a", "Foo": "f"}"#),
            "Foo",
        )
        .unwrap();
        assert_eq!(fix.primary(), "Foo");
        assert_eq!(fix.unit_names(), vec!["Foo", "Alpha", "Zeta"]);
        assert_eq!(fix.len(), 3);
    }

    #[test]
    fn test_fix_set_validation_problems() {
        let cases = [
            (r#"{}"#, "Empty"),
            (r#"{"Bar": "b"}"#, "Primary class Foo not found"),
            (r#"{"Foo": ""}"#, "Invalid or empty content for class Foo"),
            (r#"{"Foo": "f", "Bar": 3}"#, "Invalid or empty content for class Bar"),
            (r#"{"Foo": "f", "../Bar": "b"}"#, "not a valid class name"),
        ];
        for (raw, expected) in cases {
            let problem = FixSet::from_proposal(proposal(raw), "Foo").unwrap_err();
            assert!(problem.contains(expected), "{} -> {}", raw, problem);
        }
    }

    #[tokio::test]
    async fn test_direct_fix_on_first_turn() {
        let reader = Arc::new(FakeSourceReader::new().with_unit("Foo", PRIMARY_SOURCE));
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new([r#"{"Foo": "public class Foo { /* fixed */ }"}"#]);

        let fix = FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap();

        assert_eq!(fix.unit_names(), vec!["Foo"]);
        let opening = &generator.conversations()[0];
        assert!(opening.messages()[1].content.contains(PRIMARY_SOURCE));
        assert!(opening.messages()[1].content.contains("Error line: 10"));
    }

    #[tokio::test]
    async fn test_requested_class_is_fetched_and_fed_back() {
        let reader = Arc::new(
            FakeSourceReader::new()
                .with_unit("Foo", PRIMARY_SOURCE)
                .with_unit("AccountSelector", "public class AccountSelector { }"),
        );
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new([
            "NEED_MORE: AccountSelector",
            r#"{"Foo": "fixed foo", "AccountSelector": "fixed selector"}"#,
        ]);

        let fix = FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap();

        assert_eq!(fix.unit_names(), vec!["Foo", "AccountSelector"]);
        assert_eq!(reader.read_count("AccountSelector"), 1);

        let second = &generator.conversations()[1];
        assert_eq!(second.messages()[2].role, Role::Assistant);
        assert_eq!(second.messages()[2].content, "NEED_MORE: AccountSelector");
        let notice = &second.last().unwrap().content;
        assert!(notice.contains("public class AccountSelector { }"));
        assert!(notice.contains("You now have 2 classes: Foo, AccountSelector"));
    }

    #[tokio::test]
    async fn test_repeated_request_is_served_from_cache() {
        let reader = Arc::new(
            FakeSourceReader::new()
                .with_unit("Foo", PRIMARY_SOURCE)
                .with_unit("Bar", "class Bar {}"),
        );
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new([
            "NEED_MORE: Bar",
            "NEED_MORE: Bar.cls",
            "NEED_MORE: Foo",
            r#"{"Foo": "fixed"}"#,
        ]);

        FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap();

        assert_eq!(reader.read_count("Bar"), 1);
        assert_eq!(reader.read_count("Foo"), 1);
        let third = &generator.conversations()[2];
        assert!(third.last().unwrap().content.starts_with("Bar was already provided"));
    }

    #[tokio::test]
    async fn test_missing_class_is_reported_to_generator() {
        let reader = Arc::new(FakeSourceReader::new().with_unit("Foo", PRIMARY_SOURCE));
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new(["NEED_MORE: Ghost", r#"{"Foo": "fixed"}"#]);

        let fix = FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap();

        assert_eq!(fix.len(), 1);
        let conversations = generator.conversations();
        let notice = &conversations[1].last().unwrap().content;
        assert!(notice.starts_with("Could not fetch class Ghost"));
        assert!(notice.contains("Available classes: Foo"));
    }

    #[tokio::test]
    async fn test_invalid_fix_gets_repair_instruction() {
        let reader = Arc::new(FakeSourceReader::new().with_unit("Foo", PRIMARY_SOURCE));
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new([r#"{"Bar": "x"}"#, r#"{"Foo": "fixed"}"#]);

        FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap();

        let conversations = generator.conversations();
        let repair = &conversations[1].last().unwrap().content;
        assert!(repair.contains("Primary class Foo not found in fix response"));
    }

    #[tokio::test]
    async fn test_exhausts_after_five_turns() {
        let reader = Arc::new(FakeSourceReader::new().with_unit("Foo", PRIMARY_SOURCE));
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new(["hmm"; 6]);

        let err = FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RemediationError::NegotiationExhausted { turns: MAX_NEGOTIATION_TURNS, .. }
        ));
        assert_eq!(generator.call_count(), MAX_NEGOTIATION_TURNS as usize);
    }

    #[tokio::test]
    async fn test_not_fixable_ends_negotiation() {
        let reader = Arc::new(FakeSourceReader::new().with_unit("Foo", PRIMARY_SOURCE));
        let mut resolver = resolver_with(&reader).await;
        let generator = ScriptedGenerator::new(["NOT_FIXABLE: data issue", r#"{"Foo": "x"}"#]);

        let err = FixNegotiator::new(&generator, &mut resolver)
            .negotiate("Foo", PRIMARY_SOURCE, &exception())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "exception is not fixable automatically: data issue");
        assert_eq!(generator.call_count(), 1);
    }
}
