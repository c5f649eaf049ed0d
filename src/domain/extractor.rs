//! Tool-call detection over a finished model turn.
//!
//! Models express tool use in three ways, checked in order:
//!
//! 1. inline tags: `<action type="setGenre">{"genre":"noir"}</action>`
//! 2. bare JSON lines: `{"tool": "setGenre", "genre": "noir"}`
//! 3. the protocol-level tool calls collected by the adapter
//!
//! When either text form matches, those calls win and the structured calls
//! of the same turn are ignored. The agentic loop ends after executing text
//! calls, while structured calls feed back into another request.

use crate::domain::models::ToolCall;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSource {
    /// Tag or inline-JSON calls found in the prose.
    Text,
    Structured,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub source: Option<CallSource>,
    pub calls: Vec<ToolCall>,
    /// Turn text with every recognised text-form call removed.
    pub display_text: String,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

fn action_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<action\s+type\s*=\s*["']([^"']+)["']\s*(?:/>|>(.*?)</action\s*>)"#)
            .expect("action tag pattern")
    })
}

fn blank_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("blank line pattern"))
}

/// Run all three strategies over a turn's text and structured calls.
pub fn extract(text: &str, structured: &[ToolCall]) -> Extraction {
    let mut counter = 0usize;
    let mut next_id = || {
        counter += 1;
        format!("text_call_{}", counter)
    };

    let (tag_calls, without_tags) = extract_tags(text, &mut next_id);
    let (json_calls, without_json) = extract_json_lines(&without_tags, &mut next_id);

    let mut calls = tag_calls;
    calls.extend(json_calls);

    if !calls.is_empty() {
        return Extraction {
            source: Some(CallSource::Text),
            calls,
            display_text: tidy(&without_json),
        };
    }

    Extraction {
        source: if structured.is_empty() {
            None
        } else {
            Some(CallSource::Structured)
        },
        calls: structured.to_vec(),
        display_text: text.to_string(),
    }
}

/// Remove text-form tool syntax without extracting calls.
pub fn strip_tool_syntax(text: &str) -> String {
    let mut discard = || String::new();
    let (_, without_tags) = extract_tags(text, &mut discard);
    let (_, without_json) = extract_json_lines(&without_tags, &mut discard);
    tidy(&without_json)
}

fn extract_tags(text: &str, next_id: &mut impl FnMut() -> String) -> (Vec<ToolCall>, String) {
    let mut calls = Vec::new();
    for caps in action_tag().captures_iter(text) {
        let name = caps[1].trim().to_string();
        let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        let arguments = if body.is_empty() { "{}" } else { body };
        calls.push(ToolCall::new(next_id(), name, arguments));
    }
    let stripped = action_tag().replace_all(text, "").into_owned();
    (calls, stripped)
}

fn extract_json_lines(text: &str, next_id: &mut impl FnMut() -> String) -> (Vec<ToolCall>, String) {
    let mut calls = Vec::new();
    let mut kept = Vec::new();

    for line in text.split('\n') {
        match parse_json_line(line) {
            Some((name, args)) => {
                let arguments = Value::Object(args).to_string();
                calls.push(ToolCall::new(next_id(), name, arguments));
            }
            None => kept.push(line),
        }
    }

    (calls, kept.join("\n"))
}

fn parse_json_line(line: &str) -> Option<(String, Map<String, Value>)> {
    let trimmed = line.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let Value::Object(mut object) = serde_json::from_str::<Value>(trimmed).ok()? else {
        return None;
    };
    let name = match object.remove("tool")? {
        Value::String(name) if !name.trim().is_empty() => name,
        _ => return None,
    };

    for key in ["args", "arguments"] {
        if let Some(Value::Object(args)) = object.get(key) {
            return Some((name, args.clone()));
        }
    }
    Some((name, object))
}

const TAG_OPEN: &str = "<action";

enum Hold {
    /// Tool syntax of this many bytes; never shown.
    Drop(usize),
    /// Ordinary text of this many bytes.
    Show(usize),
    /// Cannot tell yet.
    Wait,
}

/// Incremental counterpart of [`strip_tool_syntax`] for live output. Text
/// that might begin a tag or an inline-JSON line is held back until it can
/// be classified; everything else passes through as soon as it arrives.
#[derive(Debug, Clone)]
pub struct DisplayFilter {
    pending: String,
    /// `pending` begins at the start of a line.
    line_start: bool,
}

impl Default for DisplayFilter {
    fn default() -> Self {
        Self {
            pending: String::new(),
            line_start: true,
        }
    }
}

impl DisplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one streamed chunk, returning the text that is safe to show.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut shown = String::new();

        loop {
            let Some(at) = self.next_suspect() else {
                self.show(self.pending.len(), &mut shown);
                break;
            };
            self.show(at, &mut shown);

            match self.classify() {
                Hold::Drop(len) => {
                    let dropped: String = self.pending.drain(..len).collect();
                    if dropped.ends_with('\n') {
                        self.line_start = true;
                    }
                }
                Hold::Show(len) => self.show(len, &mut shown),
                Hold::Wait => break,
            }
        }

        shown
    }

    /// Flush what is still held once the stream is over.
    pub fn finish(self) -> String {
        let mut discard = String::new;
        let (_, without_tags) = extract_tags(&self.pending, &mut discard);
        let (_, rest) = extract_json_lines(&without_tags, &mut discard);
        rest
    }

    fn show(&mut self, len: usize, out: &mut String) {
        if len == 0 {
            return;
        }
        let text: String = self.pending.drain(..len).collect();
        self.line_start = text.ends_with('\n');
        out.push_str(&text);
    }

    /// Byte offset of the first place tool syntax could start.
    fn next_suspect(&self) -> Option<usize> {
        // Start of the current line while only indentation has been seen.
        let mut line_begin = self.line_start.then_some(0);

        for (i, c) in self.pending.char_indices() {
            match c {
                '{' if line_begin.is_some() => return line_begin,
                '<' => {
                    let rest = &self.pending[i..];
                    if rest.starts_with(TAG_OPEN) || TAG_OPEN.starts_with(rest) {
                        return Some(i);
                    }
                    line_begin = None;
                }
                ' ' | '\t' => {}
                '\n' => line_begin = Some(i + 1),
                _ => line_begin = None,
            }
        }

        // A trailing indented line may still turn into JSON.
        line_begin.filter(|begin| *begin < self.pending.len())
    }

    fn classify(&self) -> Hold {
        let text = self.pending.as_str();
        let unindented = text.trim_start_matches([' ', '\t']);

        if self.line_start && unindented.starts_with('{') {
            return match text.find('\n') {
                Some(end) if parse_json_line(&text[..end]).is_some() => Hold::Drop(end + 1),
                Some(end) => Hold::Show(end + 1),
                None => Hold::Wait,
            };
        }
        if self.line_start && unindented.is_empty() {
            return Hold::Wait;
        }
        if text.starts_with(TAG_OPEN) {
            let after = text[TAG_OPEN.len()..].chars().next();
            return match after {
                None => Hold::Wait,
                Some(c) if !c.is_whitespace() => Hold::Show(TAG_OPEN.len()),
                Some(_) => match action_tag().find(text) {
                    Some(m) if m.start() == 0 => Hold::Drop(m.end()),
                    _ => Hold::Wait,
                },
            };
        }
        if TAG_OPEN.starts_with(text) {
            return Hold::Wait;
        }
        match text.chars().next() {
            Some(c) => Hold::Show(c.len_utf8()),
            None => Hold::Wait,
        }
    }
}

fn tidy(text: &str) -> String {
    blank_runs().replace_all(text, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(call: &ToolCall) -> Value {
        serde_json::from_str(&call.arguments).unwrap()
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        let extraction = extract("Hello", &[]);
        assert_eq!(extraction.source, None);
        assert!(extraction.is_empty());
        assert_eq!(extraction.display_text, "Hello");
    }

    #[test]
    fn test_tag_calls_are_extracted_and_stripped() {
        let text = "Switching now.\n<action type=\"setGenre\">{\"genre\":\"noir\"}</action>\nDone.";
        let extraction = extract(text, &[]);

        assert_eq!(extraction.source, Some(CallSource::Text));
        assert_eq!(extraction.calls.len(), 1);
        assert_eq!(extraction.calls[0].name, "setGenre");
        assert_eq!(extraction.calls[0].id, "text_call_1");
        assert_eq!(args(&extraction.calls[0]), json!({"genre": "noir"}));
        assert_eq!(extraction.display_text, "Switching now.\n\nDone.");
    }

    #[test]
    fn test_self_closing_tag_gets_empty_arguments() {
        let extraction = extract("<action type='undo'/> ok", &[]);
        assert_eq!(extraction.calls[0].name, "undo");
        assert_eq!(extraction.calls[0].arguments, "{}");
        assert_eq!(extraction.display_text, "ok");
    }

    #[test]
    fn test_inline_json_lines() {
        let text = "Sure!\n{\"tool\": \"setGenre\", \"genre\": \"noir\"}\n  {\"tool\": \"addBeat\", \"args\": {\"text\": \"A body\"}}  \nEnjoy.";
        let extraction = extract(text, &[]);

        assert_eq!(extraction.source, Some(CallSource::Text));
        assert_eq!(extraction.calls.len(), 2);
        assert_eq!(extraction.calls[0].name, "setGenre");
        assert_eq!(args(&extraction.calls[0]), json!({"genre": "noir"}));
        assert_eq!(extraction.calls[1].name, "addBeat");
        assert_eq!(args(&extraction.calls[1]), json!({"text": "A body"}));
        assert_eq!(extraction.display_text, "Sure!\nEnjoy.");
    }

    #[test]
    fn test_json_without_tool_key_is_prose() {
        let text = "{\"genre\": \"noir\"}";
        let extraction = extract(text, &[]);
        assert!(extraction.is_empty());
        assert_eq!(extraction.display_text, text);
    }

    #[test]
    fn test_text_calls_shadow_structured_calls() {
        let structured = vec![ToolCall::new("call_1", "setTone", "{}")];
        let text = "<action type=\"setGenre\">{\"genre\":\"noir\"}</action>";
        let extraction = extract(text, &structured);

        assert_eq!(extraction.source, Some(CallSource::Text));
        assert_eq!(extraction.calls.len(), 1);
        assert_eq!(extraction.calls[0].name, "setGenre");
    }

    #[test]
    fn test_structured_calls_used_when_text_is_clean() {
        let structured = vec![ToolCall::new("call_1", "setGenre", r#"{"genre":"noir"}"#)];
        let extraction = extract("Changing the genre.", &structured);

        assert_eq!(extraction.source, Some(CallSource::Structured));
        assert_eq!(extraction.calls, structured);
        assert_eq!(extraction.display_text, "Changing the genre.");
    }

    #[test]
    fn test_tags_and_json_lines_in_one_turn() {
        let text = "<action type=\"a\">{}</action>\n{\"tool\":\"b\"}";
        let extraction = extract(text, &[]);
        let names: Vec<_> = extraction.calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(extraction.calls[1].id, "text_call_2");
        assert_eq!(extraction.display_text, "");
    }

    fn filter_all(chunks: &[&str]) -> String {
        let mut filter = DisplayFilter::new();
        let mut shown: String = chunks.iter().map(|c| filter.push(c)).collect();
        shown.push_str(&filter.finish());
        shown
    }

    #[test]
    fn test_display_filter_hides_split_tag() {
        let shown = filter_all(&["Sure.\n<ac", "tion type=\"setGenre\">{\"genre\":", "\"noir\"}</action>", " Done."]);
        assert_eq!(shown, "Sure.\n Done.");
    }

    #[test]
    fn test_display_filter_hides_json_line() {
        let shown = filter_all(&["Ok\n  {\"tool\": \"set", "Genre\", \"genre\": \"noir\"}\nAfter"]);
        assert_eq!(shown, "Ok\nAfter");
    }

    #[test]
    fn test_display_filter_passes_prose_through() {
        let mut filter = DisplayFilter::new();
        assert_eq!(filter.push("a < b and "), "a < b and ");
        assert_eq!(filter.push("<actions> stay"), "<actions> stay");
        assert_eq!(filter.push("\n{\"genre\": \"noir\"}\n"), "\n{\"genre\": \"noir\"}\n");
        assert_eq!(filter.push("{\"half\""), "");
        assert_eq!(filter.finish(), "{\"half\"");
    }

    #[test]
    fn test_strip_tool_syntax() {
        let text = "Before\n\n<action type=\"x\">{\"k\":1}</action>\n\n\n{\"tool\":\"y\"}\nAfter";
        assert_eq!(strip_tool_syntax(text), "Before\n\nAfter");
    }
}
