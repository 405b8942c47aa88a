//! Truncated-JSON parsing and healing.
//!
//! [`parse`] is a hand-rolled recursive-descent scan that walks the same
//! JSON grammar `serde_json::from_str` would validate, and records — at the
//! exact character where input runs out — which token it was mid-way through
//! and which container position that token occupies. [`Partial::heal`] turns
//! that location into a syntactically valid completion: close every open
//! string/container, finish a truncated literal, and drop in a sentinel
//! string wherever a value was left mid-way so the caller can find it again
//! in the parsed result.

use crate::error::{Error, Result};
use bitflags::bitflags;
use serde_json::Value;

bitflags! {
    /// Where a truncated parse stopped. `heal()` combines a token bit
    /// (`VALUE_INSIDE_*`) with a container-position bit (`DICT_*`/`ARRAY_*`)
    /// describing the innermost enclosing array or object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocationFlags: u32 {
        const VALUE_INSIDE_IDENT = 1 << 0;
        const VALUE_INSIDE_STRING = 1 << 1;
        const VALUE_INSIDE_STRING_AFTER_ESCAPE = 1 << 2;
        const DICT_BEFORE_KEY = 1 << 3;
        const DICT_INSIDE_KEY = 1 << 4;
        const DICT_AFTER_KEY = 1 << 5;
        const DICT_BEFORE_VALUE = 1 << 6;
        const DICT_INSIDE_VALUE = 1 << 7;
        const DICT_AFTER_VALUE = 1 << 8;
        const ARRAY_BEFORE_VALUE = 1 << 9;
        const ARRAY_INSIDE_VALUE = 1 << 10;
        const ARRAY_AFTER_VALUE = 1 << 11;
    }
}

/// A truncated parse, with enough context to synthesize a continuation.
#[derive(Debug, Clone)]
pub struct Partial {
    pub flags: LocationFlags,
    pub truncated_source: String,
    /// The `}`/`]` closers for every still-open container, innermost last.
    pub nesting_closure: String,
    /// One slot per open container, innermost last; `Some(key)` for an
    /// object frame whose key has already been read, `None` for an array
    /// frame or an object frame still awaiting its first key.
    pub name_stack: Vec<Option<String>>,
}

/// The result of [`Partial::heal`]: a complete JSON value plus the sentinel
/// string as it actually appears in that value (which may differ from the
/// caller's `magic` argument by surrounding quotes/punctuation).
#[derive(Debug, Clone)]
pub struct Healed {
    pub json: Value,
    pub magic: String,
}

/// Outcome of [`parse`].
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    Complete(Value),
    Partial(Partial),
    None,
}

#[derive(Clone, Copy)]
enum Frame {
    Object,
    Array,
}

#[derive(Clone, Copy)]
enum Pos {
    Top,
    DictKey,
    DictValue,
    ArrayValue,
}

fn before_bits(pos: Pos) -> LocationFlags {
    match pos {
        Pos::Top => LocationFlags::empty(),
        Pos::DictKey => LocationFlags::DICT_BEFORE_KEY,
        Pos::DictValue => LocationFlags::DICT_BEFORE_VALUE,
        Pos::ArrayValue => LocationFlags::ARRAY_BEFORE_VALUE,
    }
}

fn inside_bits(pos: Pos) -> LocationFlags {
    match pos {
        Pos::Top => LocationFlags::empty(),
        Pos::DictKey => LocationFlags::DICT_INSIDE_KEY,
        Pos::DictValue => LocationFlags::DICT_INSIDE_VALUE,
        Pos::ArrayValue => LocationFlags::ARRAY_INSIDE_VALUE,
    }
}

enum Step {
    Complete,
    Truncated(LocationFlags),
    Invalid,
}

struct Scanner<'a> {
    input: &'a str,
    chars: Vec<char>,
    idx: usize,
    byte: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            idx: 0,
            byte: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.idx += 1;
            self.byte += c.len_utf8();
        }
        c
    }

    fn at_end(&self) -> bool {
        self.idx >= self.chars.len()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\n' | '\r')) {
            self.bump();
        }
    }

    fn consumed(&self) -> &'a str {
        &self.input[..self.byte]
    }
}

fn parse_string(sc: &mut Scanner, pos: Pos) -> Step {
    sc.bump(); // opening quote
    let mut after_escape = false;
    loop {
        match sc.bump() {
            None => {
                let token = if after_escape {
                    LocationFlags::VALUE_INSIDE_STRING_AFTER_ESCAPE
                } else {
                    LocationFlags::VALUE_INSIDE_STRING
                };
                return Step::Truncated(token | inside_bits(pos));
            }
            Some('\\') if !after_escape => after_escape = true,
            Some('"') if !after_escape => return Step::Complete,
            Some(_) => after_escape = false,
        }
    }
}

fn parse_ident(sc: &mut Scanner, word: &str, pos: Pos) -> Step {
    for expected in word.chars() {
        match sc.peek() {
            Some(c) if c == expected => {
                sc.bump();
            }
            Some(_) => return Step::Invalid,
            None => return Step::Truncated(LocationFlags::VALUE_INSIDE_IDENT | inside_bits(pos)),
        }
    }
    Step::Complete
}

fn parse_number(sc: &mut Scanner, pos: Pos) -> Step {
    let mut consumed = false;
    if sc.peek() == Some('-') {
        sc.bump();
    }
    while let Some(c) = sc.peek() {
        if c.is_ascii_digit() {
            consumed = true;
            sc.bump();
        } else if matches!(c, '.' | 'e' | 'E' | '+' | '-') {
            sc.bump();
        } else {
            break;
        }
    }
    if sc.at_end() {
        if consumed {
            Step::Truncated(inside_bits(pos))
        } else {
            Step::Truncated(before_bits(pos))
        }
    } else {
        Step::Complete
    }
}

fn parse_value(sc: &mut Scanner, stack: &mut Vec<Frame>, name_stack: &mut Vec<Option<String>>, pos: Pos) -> Step {
    sc.skip_ws();
    match sc.peek() {
        None => Step::Truncated(before_bits(pos)),
        Some('"') => parse_string(sc, pos),
        Some('{') => parse_object(sc, stack, name_stack),
        Some('[') => parse_array(sc, stack, name_stack),
        Some('t') => parse_ident(sc, "true", pos),
        Some('f') => parse_ident(sc, "false", pos),
        Some('n') => parse_ident(sc, "null", pos),
        Some(c) if c == '-' || c.is_ascii_digit() => parse_number(sc, pos),
        Some(_) => Step::Invalid,
    }
}

fn parse_object(sc: &mut Scanner, stack: &mut Vec<Frame>, name_stack: &mut Vec<Option<String>>) -> Step {
    sc.bump(); // '{'
    stack.push(Frame::Object);
    name_stack.push(None);
    sc.skip_ws();
    if sc.peek() == Some('}') {
        sc.bump();
        stack.pop();
        name_stack.pop();
        return Step::Complete;
    }
    loop {
        sc.skip_ws();
        match sc.peek() {
            None => return Step::Truncated(LocationFlags::DICT_BEFORE_KEY),
            Some('"') => {
                let key_start = sc.byte;
                match parse_string(sc, Pos::DictKey) {
                    Step::Complete => {
                        let key = sc.input[key_start + 1..sc.byte - 1].to_string();
                        *name_stack.last_mut().unwrap() = Some(key);
                    }
                    other => return other,
                }
            }
            Some(_) => return Step::Invalid,
        }
        sc.skip_ws();
        match sc.peek() {
            None => return Step::Truncated(LocationFlags::DICT_AFTER_KEY),
            Some(':') => {
                sc.bump();
            }
            Some(_) => return Step::Invalid,
        }
        match parse_value(sc, stack, name_stack, Pos::DictValue) {
            Step::Complete => {}
            other => return other,
        }
        sc.skip_ws();
        match sc.peek() {
            None => return Step::Truncated(LocationFlags::DICT_AFTER_VALUE),
            Some(',') => {
                sc.bump();
                *name_stack.last_mut().unwrap() = None;
                continue;
            }
            Some('}') => {
                sc.bump();
                stack.pop();
                name_stack.pop();
                return Step::Complete;
            }
            Some(_) => return Step::Invalid,
        }
    }
}

fn parse_array(sc: &mut Scanner, stack: &mut Vec<Frame>, name_stack: &mut Vec<Option<String>>) -> Step {
    sc.bump(); // '['
    stack.push(Frame::Array);
    name_stack.push(None);
    sc.skip_ws();
    if sc.peek() == Some(']') {
        sc.bump();
        stack.pop();
        name_stack.pop();
        return Step::Complete;
    }
    loop {
        match parse_value(sc, stack, name_stack, Pos::ArrayValue) {
            Step::Complete => {}
            other => return other,
        }
        sc.skip_ws();
        match sc.peek() {
            None => return Step::Truncated(LocationFlags::ARRAY_AFTER_VALUE),
            Some(',') => {
                sc.bump();
                continue;
            }
            Some(']') => {
                sc.bump();
                stack.pop();
                name_stack.pop();
                return Step::Complete;
            }
            Some(_) => return Step::Invalid,
        }
    }
}

/// Parses `input`, classifying where it ran out if it's a truncation rather
/// than a complete value or outright garbage.
pub fn parse(input: &str) -> ParseOutcome {
    let mut sc = Scanner::new(input);
    let mut stack: Vec<Frame> = Vec::new();
    let mut name_stack: Vec<Option<String>> = Vec::new();
    match parse_value(&mut sc, &mut stack, &mut name_stack, Pos::Top) {
        Step::Complete => {
            sc.skip_ws();
            if !sc.at_end() {
                return ParseOutcome::None;
            }
            match serde_json::from_str::<Value>(input) {
                Ok(v) => ParseOutcome::Complete(v),
                Err(_) => ParseOutcome::None,
            }
        }
        Step::Truncated(flags) => {
            if stack.is_empty() && flags.is_empty() {
                return ParseOutcome::None;
            }
            let truncated_source = sc.consumed().to_string();
            let nesting_closure = stack
                .iter()
                .rev()
                .map(|f| match f {
                    Frame::Object => '}',
                    Frame::Array => ']',
                })
                .collect();
            ParseOutcome::Partial(Partial {
                flags,
                truncated_source,
                nesting_closure,
                name_stack,
            })
        }
        Step::Invalid => ParseOutcome::None,
    }
}

impl Partial {
    fn move_out(mut flags: LocationFlags) -> Result<LocationFlags> {
        if flags.contains(LocationFlags::DICT_INSIDE_KEY) {
            flags.remove(LocationFlags::DICT_INSIDE_KEY);
            flags.insert(LocationFlags::DICT_AFTER_KEY);
        } else if flags.contains(LocationFlags::DICT_INSIDE_VALUE) {
            flags.remove(LocationFlags::DICT_INSIDE_VALUE);
            flags.insert(LocationFlags::DICT_AFTER_VALUE);
        } else if flags.contains(LocationFlags::ARRAY_INSIDE_VALUE) {
            flags.remove(LocationFlags::ARRAY_INSIDE_VALUE);
            flags.insert(LocationFlags::ARRAY_AFTER_VALUE);
        } else {
            return Err(Error::internal(
                "cannot move out of a location that is not inside a key, value, or array value",
            ));
        }
        Ok(flags)
    }

    /// Synthesizes a complete JSON document by closing the truncated token
    /// with `magic` and appending the minimal continuation for wherever that
    /// leaves the innermost container.
    pub fn heal(&self, magic: &str) -> Result<Healed> {
        let mut flags = self.flags;
        let mut healed_source;
        let mut actual_magic = String::new();

        if flags.contains(LocationFlags::VALUE_INSIDE_STRING) {
            healed_source = format!("{}{magic}\"", self.truncated_source);
            actual_magic = magic.to_string();
            flags.remove(LocationFlags::VALUE_INSIDE_STRING);
            flags = Self::move_out(flags)?;
        } else if flags.contains(LocationFlags::VALUE_INSIDE_STRING_AFTER_ESCAPE) {
            let trimmed = self
                .truncated_source
                .strip_suffix('\\')
                .ok_or_else(|| Error::internal("truncated source does not end in an escape"))?;
            healed_source = format!("{trimmed}{magic}\"");
            actual_magic = magic.to_string();
            flags.remove(LocationFlags::VALUE_INSIDE_STRING_AFTER_ESCAPE);
            flags = Self::move_out(flags)?;
        } else if flags.contains(LocationFlags::VALUE_INSIDE_IDENT) {
            return Err(Error::unhealable("truncated inside a keyword (true/false/null)"));
        } else {
            healed_source = self.truncated_source.clone();
        }

        if flags.contains(LocationFlags::DICT_BEFORE_KEY) {
            if actual_magic.is_empty() {
                healed_source.push_str(&format!("\"{magic}\": null"));
                actual_magic = format!("\"{magic}");
            } else {
                let trimmed = healed_source.trim_end();
                if trimmed.ends_with(',') {
                    healed_source.push_str(" \"\": null");
                } else if !trimmed.ends_with('{') {
                    return Err(Error::unhealable("stopped in an unrecognized location before a dict key"));
                }
            }
        } else if flags.contains(LocationFlags::DICT_AFTER_KEY) {
            if actual_magic.is_empty() {
                healed_source.push_str(&format!(": \"{magic}\""));
                actual_magic = format!(": \"{magic}");
            } else {
                healed_source.push_str(": null");
            }
        } else if flags.contains(LocationFlags::DICT_BEFORE_VALUE) {
            if actual_magic.is_empty() {
                healed_source.push_str(&format!("\"{magic}\""));
                actual_magic = format!("\"{magic}");
            } else {
                healed_source.push_str("null");
            }
        } else if flags.contains(LocationFlags::DICT_AFTER_VALUE) {
            if actual_magic.is_empty() {
                healed_source.push_str(&format!(", \"{magic}\": null"));
                actual_magic = format!(", \"{magic}");
            }
        } else if flags.contains(LocationFlags::ARRAY_BEFORE_VALUE) {
            if actual_magic.is_empty() {
                healed_source.push_str(&format!("\"{magic}\""));
                actual_magic = format!("\"{magic}");
            } else {
                let trimmed = healed_source.trim_end();
                if trimmed.ends_with(',') {
                    healed_source.push_str("\"\"");
                } else if !trimmed.ends_with('[') {
                    return Err(Error::unhealable("stopped in an unrecognized location before an array value"));
                }
            }
        } else if flags.contains(LocationFlags::ARRAY_AFTER_VALUE) && actual_magic.is_empty() {
            healed_source.push_str(&format!(", \"{magic}\""));
            actual_magic = format!(", \"{magic}");
        }

        healed_source.push_str(&self.nesting_closure);

        let json: Value = serde_json::from_str(&healed_source)?;
        Ok(Healed { json, magic: actual_magic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(input: &str) -> Partial {
        match parse(input) {
            ParseOutcome::Partial(p) => p,
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[test]
    fn complete_object_parses_fully() {
        match parse("{\"a\": 1}") {
            ParseOutcome::Complete(v) => assert_eq!(v["a"], 1),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_is_none() {
        assert!(matches!(parse("{\"a\": 1} garbage"), ParseOutcome::None));
    }

    #[test]
    fn boundary_scenario_heal_string_value() {
        let p = partial("{\"a\": \"Par");
        assert!(p.flags.contains(LocationFlags::VALUE_INSIDE_STRING));
        assert!(p.flags.contains(LocationFlags::DICT_INSIDE_VALUE));
        let healed = p.heal("Z").unwrap();
        assert_eq!(healed.json, serde_json::json!({"a": "ParZ"}));
        assert_eq!(healed.magic, "Z");
    }

    #[test]
    fn heal_truncated_before_key() {
        let p = partial("{");
        assert_eq!(p.flags, LocationFlags::DICT_BEFORE_KEY);
        let healed = p.heal("X").unwrap();
        assert_eq!(healed.json, serde_json::json!({"X": null}));
    }

    #[test]
    fn heal_truncated_after_comma_in_array() {
        let p = partial("[1, 2,");
        assert!(p.flags.contains(LocationFlags::ARRAY_BEFORE_VALUE));
        let healed = p.heal("X").unwrap();
        assert_eq!(healed.json, serde_json::json!([1, 2, "X"]));
    }

    #[test]
    fn heal_truncated_after_array_value() {
        let p = partial("[1, 2");
        assert!(p.flags.contains(LocationFlags::ARRAY_INSIDE_VALUE));
        // a bare numeric tail is already a complete token; no magic needed.
        let healed = p.heal("X").unwrap();
        assert_eq!(healed.json, serde_json::json!([1, 2]));
    }

    #[test]
    fn truncated_inside_ident_is_unhealable() {
        let p = partial("{\"a\": tru");
        assert!(p.flags.contains(LocationFlags::VALUE_INSIDE_IDENT));
        assert!(matches!(p.heal("X"), Err(Error::Unhealable(_))));
    }

    #[test]
    fn nested_object_reports_innermost_frame() {
        let p = partial("{\"a\": {\"b\": \"c");
        assert!(p.flags.contains(LocationFlags::VALUE_INSIDE_STRING));
        assert!(p.flags.contains(LocationFlags::DICT_INSIDE_VALUE));
        assert_eq!(p.nesting_closure, "}}");
        assert_eq!(p.name_stack, vec![Some("a".to_string()), Some("b".to_string())]);
    }

    #[test]
    fn empty_input_is_none() {
        assert!(matches!(parse(""), ParseOutcome::None));
    }
}
