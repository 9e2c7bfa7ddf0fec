// ═══════════════════════════════════════════════════════════════════════════════
// SENTINELS (recognized by the negotiation reply classifier)
// ═══════════════════════════════════════════════════════════════════════════════

pub const NEED_MORE_SENTINEL: &str = "NEED_MORE:";
pub const NOT_FIXABLE_SENTINEL: &str = "NOT_FIXABLE:";

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

const RAW_JSON_RULES: &str = r#"OUTPUT RULES:
- Return ONLY raw JSON: no markdown, no code fences, no commentary.
- Escape quotes and newlines inside strings.
- Validate your JSON before responding."#;

const ROOT_CAUSE_HINTS: &str = r#"ROOT CAUSE HINTS:
- The stack trace shows the execution path; the root cause may live in classes that are NOT in the trace.
- Look at method calls, constructor calls and dependencies in the classes you have.
- Service classes usually call Selector classes for SOQL; Util, Helper and Factory classes transform, validate or build data.
- Missing-field errors usually need fields added to a SOQL query in a selector class.
- Null dereferences usually need fixes where the null object is created or fetched.
- NullPointerException: add null checks and inspect the classes that return null.
- ListException: add bounds checks and inspect the classes that populate the list.
- DmlException: validate or guard DML and inspect the classes that prepare the records.
- QueryException: harden SOQL handling and inspect the selector classes.
- StringException: validate strings and inspect the classes that build them.
- MathException: guard divisions and inspect the classes that compute the operands."#;

// ═══════════════════════════════════════════════════════════════════════════════
// STACK TRACE DIAGNOSIS
// ═══════════════════════════════════════════════════════════════════════════════

pub const TRACE_PARSE_SYSTEM: &str = r#"You are a JSON parser for Salesforce Apex stack traces.

Return exactly one JSON object in this shape:
{
  "fixable": true,
  "frames": [
    {"class": "ClassName", "method": "methodName", "line": 25}
  ]
}

RULES:
- Only include Apex CLASSES in frames, never triggers.
- For a frame like 'Trigger.SomeTrigger', use the class that trigger calls.
- Order frames top to bottom in call-stack order.
- Set "fixable" to false only if no code change in a class could prevent the exception.
"#;

pub fn trace_parse_user(exception_message: &str, stack_trace: &str) -> String {
    format!(
        "Exception: {}\n\nStack trace:\n{}",
        exception_message, stack_trace
    )
}

pub fn trace_parse_system() -> String {
    format!("{}\n{}", TRACE_PARSE_SYSTEM, RAW_JSON_RULES)
}

pub fn trace_repair(problem: &str) -> String {
    format!(
        "Invalid response: {}. Provide ONLY valid JSON in the exact format specified, no markdown or extra text.",
        problem
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIX NEGOTIATION
// ═══════════════════════════════════════════════════════════════════════════════

pub const FIX_NEGOTIATION_SYSTEM: &str = r#"You are a Salesforce Apex expert fixing a runtime exception.

You will receive the exception, the stack trace and the class where it was raised.

Each reply must be exactly ONE of:
1. A request for one more class, as a single line:
NEED_MORE: ClassName
2. The fix, as one JSON object mapping class names to their COMPLETE fixed source:
{
  "ClassName1": "<complete fixed class source>",
  "ClassName2": "<complete fixed class source>"
}
3. If no change to Apex classes can fix this exception, a single line:
NOT_FIXABLE: <one sentence reason>

FIX RULES:
- Always include the class where the exception was raised.
- Return whole classes, never fragments or diffs.
- Preserve all existing behavior; make the minimal change for this exception type."#;

pub fn fix_negotiation_system() -> String {
    format!(
        "{}\n\n{}\n\n{}",
        FIX_NEGOTIATION_SYSTEM, ROOT_CAUSE_HINTS, RAW_JSON_RULES
    )
}

pub fn fix_negotiation_opening(
    exception_message: &str,
    error_line: u32,
    stack_trace: &str,
    primary_unit: &str,
    primary_source: &str,
) -> String {
    format!(
        "Exception: {message}\n\
         Error line: {line}\n\
         Stack trace:\n{trace}\n\n\
         Primary class ({unit}):\n{source}\n\n\
         If {unit} depends on service, selector or utility classes that may hold the root cause, request them one at a time.\n\
         Otherwise provide the complete fix.",
        message = exception_message,
        line = error_line,
        trace = stack_trace,
        unit = primary_unit,
        source = primary_source,
    )
}

pub fn unit_provided(unit: &str, source: &str, available: &[String]) -> String {
    format!(
        "Here is {unit}:\n{source}\n\n\
         You now have {count} classes: {list}\n\
         Analyze them together. Request another class if the root cause is still unclear; otherwise provide the complete fix.",
        unit = unit,
        source = source,
        count = available.len(),
        list = available.join(", "),
    )
}

pub fn unit_already_provided(unit: &str, source: &str, available: &[String]) -> String {
    format!(
        "{unit} was already provided. Here it is again:\n{source}\n\n\
         Classes available: {list}\n\
         Request a different class or provide the complete fix.",
        unit = unit,
        source = source,
        list = available.join(", "),
    )
}

pub fn unit_unavailable(unit: &str, error: &str, available: &[String]) -> String {
    format!(
        "Could not fetch class {unit}. Error: {error}\n\n\
         Available classes: {list}\n\
         Either request a different class name if this one was wrong, or proceed with the available classes and provide the best fix possible.",
        unit = unit,
        error = error,
        list = available.join(", "),
    )
}

pub fn fix_repair(problem: &str) -> String {
    format!(
        "Invalid response: {}. Reply with either a single 'NEED_MORE: ClassName' line or ONLY valid JSON with complete class content in the exact format specified.",
        problem
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompts_mention_json_and_sentinels() {
        assert!(trace_parse_system().contains("JSON"));
        let fix = fix_negotiation_system();
        assert!(fix.contains(NEED_MORE_SENTINEL));
        assert!(fix.contains(NOT_FIXABLE_SENTINEL));
        assert!(fix.contains("ROOT CAUSE HINTS"));
    }

    #[test]
    fn test_opening_message_carries_context() {
        let opening = fix_negotiation_opening("NPE", 10, "Class.Foo.bar: line 10", "Foo", "class Foo {}");
        assert!(opening.contains("Exception: NPE"));
        assert!(opening.contains("Error line: 10"));
        assert!(opening.contains("Primary class (Foo):\nclass Foo {}"));
    }

    #[test]
    fn test_unit_notices_list_available_classes() {
        let available = vec!["Foo".to_string(), "Bar".to_string()];
        let provided = unit_provided("Bar", "class Bar {}", &available);
        assert!(provided.contains("You now have 2 classes: Foo, Bar"));

        let missing = unit_unavailable("Baz", "not found", &available);
        assert!(missing.contains("Could not fetch class Baz"));
        assert!(missing.contains("Available classes: Foo, Bar"));
    }
}
