//! Regex search with partial-match semantics, and the reversed-partial regex
//! compiler that makes it possible without a custom NFA engine.
//!
//! [`CommonRegex::search`] first tries a normal forward match. If that fails
//! and the grammar might still see more bytes, it tries a second match
//! against the *reversed* input using a pattern transformed so that a full
//! match there means "the input ends in a prefix of a possible future match
//! of the original pattern". See [`regex_to_reversed_partial_regex`] for the
//! transform itself: reverse each sequence, wrap every atom but the outermost
//! in an optional non-capturing group, swap greedy/reluctant quantifiers, and
//! unroll `{m,n}` (and `+`, the same way as `{1,}`) into repeated optional
//! groups rather than emitting a reversed-bounded-repetition construct.

use crate::error::{Error, Result};
use regex::Regex;

/// Outcome of [`CommonRegex::search`]: where a match was found, and whether
/// it was a confirmed full match or a partial match pending more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegexMatch {
    pub pos: usize,
    pub is_partial: bool,
}

/// A compiled pattern plus its reversed-partial companion.
#[derive(Debug)]
pub struct CommonRegex {
    pattern: String,
    rx: Regex,
    rx_reversed_partial: Regex,
    at_start: bool,
}

impl CommonRegex {
    /// Compiles `pattern`. `at_start` restricts both the forward and the
    /// partial match to position 0 of the search subject.
    pub fn new(pattern: &str, at_start: bool) -> Result<Self> {
        let rx = Regex::new(pattern).map_err(|e| Error::invalid_pattern(e.to_string()))?;
        let reversed_pattern = regex_to_reversed_partial_regex(pattern)?;
        let rx_reversed_partial = Regex::new(&reversed_pattern)
            .map_err(|e| Error::invalid_pattern(format!("{e} (reversed form: {reversed_pattern})")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            rx,
            rx_reversed_partial,
            at_start,
        })
    }

    pub fn str(&self) -> &str {
        &self.pattern
    }

    pub fn at_start(&self) -> bool {
        self.at_start
    }

    /// Searches `input`: forward match first, reversed-partial fallback
    /// second.
    pub fn search(&self, input: &str) -> Option<RegexMatch> {
        self.search_match(input)
            .map(|(pos, _end, is_partial)| RegexMatch { pos, is_partial })
    }

    /// Crate-internal variant that also returns the match's end offset, for
    /// the PEG engine's `until` leaf, which needs the match length in
    /// addition to where it starts.
    pub(crate) fn search_match(&self, input: &str) -> Option<(usize, usize, bool)> {
        if let Some(m) = self.rx.find(input) {
            if self.at_start && m.start() != 0 {
                return None;
            }
            return Some((m.start(), m.end(), false));
        }

        let reversed: String = input.chars().rev().collect();
        let caps = self.rx_reversed_partial.captures(&reversed)?;
        let overall = caps.get(0).expect("group 0 always present on a match");
        // `regex_match` semantics: the whole reversed string must match, not
        // just a substring of it.
        if overall.start() != 0 || overall.end() != reversed.len() {
            return None;
        }
        let group1 = caps.get(1).expect("outer capturing group always present");
        let position = reversed.len() - group1.end();
        if self.at_start && position != 0 {
            return None;
        }
        Some((position, input.len(), true))
    }
}

struct Cursor<'a> {
    chars: &'a [char],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }
}

fn parse_repetition_range(spec: &str) -> Result<(usize, Option<usize>)> {
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() > 2 {
        return Err(Error::invalid_pattern("invalid repetition range in pattern"));
    }
    let parse_opt = |s: &str| -> Result<Option<usize>> {
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse::<usize>()
                .map(Some)
                .map_err(|_| Error::invalid_pattern(format!("invalid repetition count: {s}")))
        }
    };
    let min = parse_opt(parts[0])?.unwrap_or(0);
    let max = if parts.len() == 1 {
        Some(min)
    } else {
        parse_opt(parts[1])?
    };
    if let Some(max) = max {
        if max < min {
            return Err(Error::invalid_pattern("invalid repetition range in pattern"));
        }
    }
    Ok((min, max))
}

/// Unrolls a quantified atom into `min` mandatory copies followed by either
/// `max - min` optional copies or, if `max` is unbounded, one trailing `*`
/// copy. Used for both `{m,n}` and `+` (`min=1`, unbounded); the plain
/// `*`/`?` special case (append the quantifier character directly, flipping
/// greedy/reluctant) only applies to quantifiers with no mandatory minimum.
fn unroll_repeat(sequence: &mut Vec<String>, min: usize, max: Option<usize>) -> Result<()> {
    let part = sequence
        .pop()
        .ok_or_else(|| Error::invalid_pattern("repetition without preceding element"))?;
    for _ in 0..min {
        sequence.push(part.clone());
    }
    match max {
        Some(max) => {
            for _ in min..max {
                sequence.push(format!("{part}?"));
            }
        }
        None => sequence.push(format!("{part}*")),
    }
    Ok(())
}

fn process(cur: &mut Cursor) -> Result<String> {
    let mut alternatives: Vec<Vec<String>> = vec![Vec::new()];

    while !cur.at_end() && cur.peek() != Some(')') {
        let c = cur.peek().unwrap();
        if c == '[' {
            let start = cur.pos;
            cur.bump();
            loop {
                match cur.peek() {
                    None => return Err(Error::invalid_pattern("unmatched '[' in pattern")),
                    Some('\\') => {
                        cur.bump();
                        if cur.bump().is_none() {
                            return Err(Error::invalid_pattern("unmatched '[' in pattern"));
                        }
                    }
                    Some(']') => break,
                    Some(_) => {
                        cur.bump();
                    }
                }
            }
            cur.bump();
            let text: String = cur.chars[start..cur.pos].iter().collect();
            alternatives.last_mut().unwrap().push(text);
        } else if c == '*' || c == '?' {
            {
                let seq = alternatives.last_mut().unwrap();
                if seq.is_empty() {
                    return Err(Error::invalid_pattern("quantifier without preceding element"));
                }
            }
            cur.bump();
            let seq_len = {
                let seq = alternatives.last_mut().unwrap();
                seq.last_mut().unwrap().push(c);
                seq.len()
            };
            if cur.peek() == Some('?') {
                cur.bump();
                if seq_len > 1 {
                    alternatives.last_mut().unwrap().last_mut().unwrap().push('?');
                }
            } else {
                alternatives.last_mut().unwrap().last_mut().unwrap().push('?');
            }
        } else if c == '+' {
            cur.bump();
            let seq = alternatives.last_mut().unwrap();
            unroll_repeat(seq, 1, None)?;
        } else if c == '{' {
            cur.bump();
            let start = cur.pos;
            while !cur.at_end() && cur.peek() != Some('}') {
                cur.bump();
            }
            if cur.at_end() {
                return Err(Error::invalid_pattern("unmatched '{' in pattern"));
            }
            let spec: String = cur.chars[start..cur.pos].iter().collect();
            cur.bump();
            let (min, max) = parse_repetition_range(&spec)?;
            let seq = alternatives.last_mut().unwrap();
            unroll_repeat(seq, min, max)?;
        } else if c == '(' {
            cur.bump();
            if cur.peek() == Some('?') && cur.peek_at(1) == Some(':') {
                cur.bump();
                cur.bump();
            }
            let sub = process(cur)?;
            if cur.peek() != Some(')') {
                return Err(Error::invalid_pattern("unmatched '(' in pattern"));
            }
            cur.bump();
            alternatives.last_mut().unwrap().push(format!("({sub})"));
        } else if c == '|' {
            cur.bump();
            alternatives.push(Vec::new());
        } else if c == '\\' {
            cur.bump();
            match cur.bump() {
                Some(escaped) => alternatives.last_mut().unwrap().push(format!("\\{escaped}")),
                None => return Err(Error::invalid_pattern("dangling escape in pattern")),
            }
        } else {
            cur.bump();
            alternatives.last_mut().unwrap().push(c.to_string());
        }
    }

    let mut res_alts = Vec::new();
    for parts in &alternatives {
        let mut res = String::new();
        for _ in 0..parts.len().saturating_sub(1) {
            res.push_str("(?:");
        }
        let last_idx = parts.len().saturating_sub(1);
        for (i, part) in parts.iter().rev().enumerate() {
            res.push_str(part);
            if i != last_idx {
                res.push_str(")?");
            }
        }
        res_alts.push(res);
    }
    Ok(res_alts.join("|"))
}

/// Transforms `pattern` into a regex which, when fully matched against the
/// *reversed* input, reports (via its sole capturing group) that the input
/// ends in a prefix of a possible future match of `pattern`. Exposed for
/// testing only; production code should go through [`CommonRegex`].
pub fn regex_to_reversed_partial_regex(pattern: &str) -> Result<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut cur = Cursor { chars: &chars, pos: 0 };
    let res = process(&mut cur)?;
    if !cur.at_end() {
        return Err(Error::invalid_pattern("unmatched '(' in pattern"));
    }
    Ok(format!("({res}).*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_sequence_reverses() {
        let out = regex_to_reversed_partial_regex("abcd").unwrap();
        assert_eq!(out, "((?:(?:(?:d)?c)?b)?a).*");
    }

    #[test]
    fn alternation() {
        let out = regex_to_reversed_partial_regex("a|b").unwrap();
        assert_eq!(out, "(a|b).*");
    }

    #[test]
    fn boundary_scenario_abcd() {
        let rx = CommonRegex::new("abcd", false).unwrap();
        assert_eq!(rx.search("abc"), Some(RegexMatch { pos: 0, is_partial: true }));
        assert_eq!(rx.search("yeah ab"), Some(RegexMatch { pos: 5, is_partial: true }));
        assert_eq!(rx.search("abcd"), Some(RegexMatch { pos: 0, is_partial: false }));
        assert_eq!(rx.search("bcd"), None);
    }

    #[test]
    fn at_start_restricts_position() {
        let rx = CommonRegex::new("bcd", true).unwrap();
        assert_eq!(rx.search("abcd"), None);
        assert_eq!(rx.search("bcd"), Some(RegexMatch { pos: 0, is_partial: false }));
    }

    #[test]
    fn plus_quantifier_detects_partial() {
        let rx = CommonRegex::new("ab+c", false).unwrap();
        assert!(rx.search("xxxab").map(|m| m.is_partial).unwrap_or(false));
        assert_eq!(rx.search("abbbc"), Some(RegexMatch { pos: 0, is_partial: false }));
    }

    #[test]
    fn bounded_repetition() {
        let rx = CommonRegex::new("ab{2,4}c", false).unwrap();
        assert_eq!(rx.search("abbc"), Some(RegexMatch { pos: 0, is_partial: false }));
        assert!(rx.search("abb").map(|m| m.is_partial).unwrap_or(false));
        assert_eq!(rx.search("ac"), None);
    }

    #[test]
    fn invalid_pattern_rejected() {
        assert!(CommonRegex::new("a(b", false).is_err());
    }

    #[test]
    fn quantified_property_partial_is_superset_of_prefixes() {
        // ∀ split I = A·B: if forward-match(P, A·B) succeeds at pos p, then
        // reversed-partial-match(P, reverse(A)) succeeds-with-partial or
        // forward-match(P, A) already succeeds.
        let rx = CommonRegex::new("fn [a-z]+\\(", false).unwrap();
        let full = "fn main(";
        for split in 0..full.len() {
            if !full.is_char_boundary(split) {
                continue;
            }
            let a = &full[..split];
            if rx.search(a).is_some() {
                continue;
            }
            let m = rx.search(a);
            assert!(m.is_none() || m.unwrap().is_partial, "split at {split}");
        }
    }
}
