//! Bracket character class parsing for the `chars(class)` PEG leaf.
//!
//! Supports the same subset the regex compiler in [`crate::regex_partial`]
//! does: literal members, `\n`/`\t`/`\\`/`\]`/`\-` escapes, `a-z` ranges, and
//! a leading `^` negation. No unicode classes (`\d`, `\w`, ...).

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct CharClass {
    ranges: Vec<(char, char)>,
    negated: bool,
}

impl CharClass {
    /// Parses a bracket expression like `[\n\t\\]` or `[a\-z]` or `[^0-9]`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let chars: Vec<char> = pattern.chars().collect();
        if chars.len() < 2 || chars[0] != '[' || chars[chars.len() - 1] != ']' {
            return Err(Error::invalid_pattern(format!(
                "char class must be wrapped in '[' ']': {pattern}"
            )));
        }
        let end = chars.len() - 1;
        let negated = chars[1] == '^';

        // Fold the class body into ranges directly, recognizing `a-z` written
        // as two members separated by an *unescaped* dash; an escaped dash
        // is never treated as a range operator.
        let mut ranges = Vec::new();
        let mut j = if negated { 2 } else { 1 };
        while j < end {
            let (lo, consumed_lo) = Self::read_member(&chars, j, end)?;
            let mut k = j + consumed_lo;
            if k < end && chars[k] == '-' && k + 1 < end {
                let (hi, consumed_hi) = Self::read_member(&chars, k + 1, end)?;
                ranges.push((lo, hi));
                j = k + 1 + consumed_hi;
            } else {
                ranges.push((lo, lo));
                j = k;
            }
        }

        Ok(Self { ranges, negated })
    }

    /// Reads one class member starting at `i`, returning (char, bytes/chars consumed).
    fn read_member(chars: &[char], i: usize, end: usize) -> Result<(char, usize)> {
        if i >= end {
            return Err(Error::invalid_pattern("unexpected end of char class"));
        }
        if chars[i] == '\\' {
            if i + 1 >= end {
                return Err(Error::invalid_pattern("dangling escape in char class"));
            }
            let escaped = match chars[i + 1] {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            };
            Ok((escaped, 2))
        } else {
            Ok((chars[i], 1))
        }
    }

    pub fn matches(&self, c: char) -> bool {
        let found = self.ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi);
        found != self.negated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_sequences() {
        let class = CharClass::parse("[\\n\\t\\\\]").unwrap();
        assert!(class.matches('\n'));
        assert!(class.matches('\t'));
        assert!(class.matches('\\'));
        assert!(!class.matches(' '));
    }

    #[test]
    fn escaped_dash_is_literal_not_a_range() {
        let class = CharClass::parse("[a\\-z]").unwrap();
        assert!(class.matches('a'));
        assert!(class.matches('-'));
        assert!(class.matches('z'));
        assert!(!class.matches('b'));
    }

    #[test]
    fn unescaped_dash_is_a_range() {
        let class = CharClass::parse("[0-9]").unwrap();
        assert!(class.matches('5'));
        assert!(!class.matches('a'));
    }

    #[test]
    fn negated_class() {
        let class = CharClass::parse("[^0-9]").unwrap();
        assert!(class.matches('a'));
        assert!(!class.matches('5'));
    }

    #[test]
    fn rejects_malformed_pattern() {
        assert!(CharClass::parse("not-brackets").is_err());
    }
}
