//! The streaming PEG combinator engine: grammar construction, packrat-memoized
//! evaluation, and the arena construction/retraction rules that make partial
//! input safe to parse repeatedly as more of it arrives.
//!
//! Grammar rule cycles are guarded by a `(rule_id, offset)` in-progress set so
//! a left-recursive or otherwise self-referential rule fails instead of
//! looping. The `until` leaf is wired to [`crate::regex_partial::CommonRegex`]
//! so that streaming content recognition gets partial-match awareness for
//! free rather than blocking until a delimiter is fully confirmed or the
//! stream ends.

use crate::ast::{Arena, AstNode, Tag, TokenSpan};
use crate::charclass::CharClass;
use crate::error::{Error, Result};
use crate::regex_partial::CommonRegex;
use std::collections::{HashMap, HashSet};

pub type ParserId = usize;
pub type RuleId = usize;

#[derive(Debug)]
enum ParserNode {
    Literal(String),
    Chars(CharClass),
    Until(CommonRegex),
    Preserved(String, u32),
    Seq(Vec<ParserId>),
    Alt(Vec<ParserId>),
    Optional(ParserId),
    ZeroOrMore(ParserId),
    Atomic(ParserId),
    Tag(Tag, ParserId),
    RuleRef(RuleId),
}

/// Builds a [`Grammar`]. Leaves and combinators are pushed into a flat arena
/// and referenced by integer id; named rules resolve their `ref`s at
/// [`GrammarBuilder::build`] time, which is also the only point at which an
/// undefined rule is detected.
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    nodes: Vec<ParserNode>,
    rule_bodies: Vec<Option<ParserId>>,
    rule_names: HashMap<String, RuleId>,
    root: Option<ParserId>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: ParserNode) -> ParserId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn literal(&mut self, s: impl Into<String>) -> ParserId {
        self.push(ParserNode::Literal(s.into()))
    }

    /// `class` is a bracket expression like `[0-9]` or `[^a-zA-Z_]`, escape
    /// rules per [`crate::charclass`]. Matches exactly one character.
    pub fn chars(&mut self, class: &str) -> Result<ParserId> {
        let parsed = CharClass::parse(class)?;
        Ok(self.push(ParserNode::Chars(parsed)))
    }

    /// Matches every character up to the next occurrence of `delimiter`,
    /// without consuming the delimiter. Built on a partial-match-aware
    /// search so content can be emitted before the delimiter is fully
    /// confirmed: if the input currently ends in what might be the start of
    /// `delimiter`, the boundary is reported there and flagged uncertain
    /// (see [`Tag`]-wrapped nodes' `is_partial`) rather than swallowed as
    /// content or blocked on entirely.
    pub fn until(&mut self, delimiter: &str) -> Result<ParserId> {
        let pattern = regex::escape(delimiter);
        let rx = CommonRegex::new(&pattern, false)?;
        Ok(self.push(ParserNode::Until(rx)))
    }

    /// Matches `literal` by token identity when `token_spans` are supplied
    /// to the parse context; degrades to a plain literal match otherwise.
    pub fn preserved(&mut self, literal: impl Into<String>, token_id: u32) -> ParserId {
        self.push(ParserNode::Preserved(literal.into(), token_id))
    }

    pub fn seq(&mut self, parts: impl IntoIterator<Item = ParserId>) -> ParserId {
        self.push(ParserNode::Seq(parts.into_iter().collect()))
    }

    pub fn alt(&mut self, parts: impl IntoIterator<Item = ParserId>) -> ParserId {
        self.push(ParserNode::Alt(parts.into_iter().collect()))
    }

    pub fn optional(&mut self, p: ParserId) -> ParserId {
        self.push(ParserNode::Optional(p))
    }

    pub fn zero_or_more(&mut self, p: ParserId) -> ParserId {
        self.push(ParserNode::ZeroOrMore(p))
    }

    /// Sugar for `seq(p, zero_or_more(p))`, exactly as the original grammar
    /// combinators compose it.
    pub fn one_or_more(&mut self, p: ParserId) -> ParserId {
        let rest = self.zero_or_more(p);
        self.seq([p, rest])
    }

    /// Forbids a partial tagged node anywhere inside `p`: a Success carrying
    /// one is downgraded to `NeedMoreInput` (or to `Fail`, with the node
    /// erased, once the parse is known final — see [`ParseContext`]).
    pub fn atomic(&mut self, p: ParserId) -> ParserId {
        self.push(ParserNode::Atomic(p))
    }

    pub fn tag(&mut self, tag: Tag, p: ParserId) -> ParserId {
        self.push(ParserNode::Tag(tag, p))
    }

    fn rule_id_for(&mut self, name: &str) -> RuleId {
        if let Some(&id) = self.rule_names.get(name) {
            return id;
        }
        let id = self.rule_bodies.len();
        self.rule_bodies.push(None);
        self.rule_names.insert(name.to_string(), id);
        id
    }

    /// Late-bound reference to a rule that may not be defined yet (mutual
    /// recursion). Resolved by name at [`build`](Self::build) time.
    pub fn r#ref(&mut self, name: &str) -> ParserId {
        let rule_id = self.rule_id_for(name);
        self.push(ParserNode::RuleRef(rule_id))
    }

    /// Registers `body` as the definition of rule `name`, returning a
    /// reference to it usable anywhere a `ParserId` is expected.
    pub fn rule(&mut self, name: &str, body: ParserId) -> ParserId {
        let rule_id = self.rule_id_for(name);
        self.rule_bodies[rule_id] = Some(body);
        self.push(ParserNode::RuleRef(rule_id))
    }

    pub fn set_root(&mut self, p: ParserId) {
        self.root = Some(p);
    }

    /// Finalizes the grammar. Fails if any `ref`'d rule was never given a
    /// body via [`rule`](Self::rule), or if no root was set.
    pub fn build(self) -> Result<Grammar> {
        for (name, &id) in &self.rule_names {
            if self.rule_bodies[id].is_none() {
                let msg = format!("rule '{name}' is referenced but never defined");
                log::warn!("grammar build failed: {msg}");
                return Err(Error::invalid_grammar(msg));
            }
        }
        let root = self.root.ok_or_else(|| {
            let msg = "grammar has no root rule set".to_string();
            log::warn!("grammar build failed: {msg}");
            Error::invalid_grammar(msg)
        })?;
        let rules = self.rule_bodies.into_iter().map(|b| b.unwrap()).collect();
        Ok(Grammar {
            nodes: self.nodes,
            rules,
            root,
        })
    }
}

/// An immutable, built grammar. Cheap to clone-by-reference and reuse across
/// many [`Grammar::parse`] calls; each call gets its own arena and memo
/// table.
#[derive(Debug)]
pub struct Grammar {
    nodes: Vec<ParserNode>,
    rules: Vec<ParserId>,
    root: ParserId,
}

/// Input to a single parse attempt. `end_is_final = false` means more bytes
/// may still arrive, which is what makes `NeedMoreInput` meaningful;
/// re-parsing with a longer `input` and the same `end_is_final` value is how
/// the engine handles streaming, with no coroutines or saved parser state
/// needed between calls.
pub struct ParseContext<'a> {
    pub input: &'a str,
    pub end_is_final: bool,
    pub token_spans: Option<&'a [TokenSpan]>,
}

impl<'a> ParseContext<'a> {
    pub fn new(input: &'a str, end_is_final: bool) -> Self {
        Self {
            input,
            end_is_final,
            token_spans: None,
        }
    }

    pub fn with_token_spans(mut self, spans: &'a [TokenSpan]) -> Self {
        self.token_spans = Some(spans);
        self
    }
}

/// Outcome of a parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Success { end: usize, roots: Vec<usize> },
    Fail,
    NeedMoreInput,
}

impl ParseResult {
    /// The top-level AST node indices produced, or `&[]` if the parse did
    /// not succeed. Pair with [`Arena::visit`] as `arena.visit(result.roots(), ...)`.
    pub fn roots(&self) -> &[usize] {
        match self {
            ParseResult::Success { roots, .. } => roots,
            _ => &[],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ParseResult::Success { .. })
    }
}

#[derive(Clone)]
struct EvalOk {
    end: usize,
    children: Vec<usize>,
    /// Set when the match's end boundary could still move if more input
    /// arrived (e.g. `until` stopping at a potential, unconfirmed delimiter
    /// start). Consumed only by [`ParserNode::Tag`] to compute `is_partial`.
    partial_terminal: bool,
}

impl EvalOk {
    fn confirmed(end: usize, children: Vec<usize>) -> Self {
        Self {
            end,
            children,
            partial_terminal: false,
        }
    }
}

enum Verdict {
    Success(EvalOk),
    Fail,
    NeedMoreInput,
}

#[derive(Clone)]
struct CachedSuccess {
    end: usize,
    partial_terminal: bool,
    /// Nodes created during the cached rule invocation, with `children`
    /// indices rebased to be local (zero-based) to this snapshot.
    snapshot: Vec<AstNode>,
    /// Local indices of the top-level nodes the invocation returned.
    roots: Vec<usize>,
}

impl CachedSuccess {
    fn capture(arena: &Arena, marker: usize, ok: &EvalOk) -> Self {
        let mut snapshot = Vec::with_capacity(arena.len() - marker);
        for i in marker..arena.len() {
            let n = arena.get(i);
            snapshot.push(AstNode {
                tag: n.tag,
                span: n.span.clone(),
                is_partial: n.is_partial,
                children: n.children.iter().map(|c| c - marker).collect(),
            });
        }
        let roots = ok.children.iter().map(|c| c - marker).collect();
        CachedSuccess {
            end: ok.end,
            partial_terminal: ok.partial_terminal,
            snapshot,
            roots,
        }
    }

    /// Re-materializes the cached subtree at the arena's current append
    /// position. Replaying rather than reusing the original indices is what
    /// keeps the cache correct across arena truncation: a prior, unrelated
    /// speculative failure elsewhere may have truncated away indices that
    /// numerically coincide with ones this snapshot remembers.
    fn replay(&self, arena: &mut Arena) -> EvalOk {
        let base = arena.len();
        for n in &self.snapshot {
            arena.push(AstNode {
                tag: n.tag,
                span: n.span.clone(),
                is_partial: n.is_partial,
                children: n.children.iter().map(|c| c + base).collect(),
            });
        }
        EvalOk {
            end: self.end,
            children: self.roots.iter().map(|r| r + base).collect(),
            partial_terminal: self.partial_terminal,
        }
    }
}

#[derive(Clone)]
enum CacheEntry {
    Success(CachedSuccess),
    Fail,
    NeedMoreInput,
}

struct Evaluator<'g, 'c> {
    grammar: &'g Grammar,
    input: &'c str,
    end_is_final: bool,
    token_spans: Option<&'c [TokenSpan]>,
    arena: Arena,
    memo: HashMap<(RuleId, usize), CacheEntry>,
    in_progress: HashSet<(RuleId, usize)>,
}

impl<'g, 'c> Evaluator<'g, 'c> {
    fn eval(&mut self, id: ParserId, offset: usize) -> Verdict {
        let grammar = self.grammar;
        match &grammar.nodes[id] {
            ParserNode::Literal(s) => self.eval_literal(s, offset),
            ParserNode::Chars(c) => self.eval_chars(c, offset),
            ParserNode::Until(rx) => self.eval_until(rx, offset),
            ParserNode::Preserved(s, token_id) => self.eval_preserved(s, *token_id, offset),
            ParserNode::Seq(parts) => self.eval_seq(parts, offset),
            ParserNode::Alt(parts) => self.eval_alt(parts, offset),
            ParserNode::Optional(p) => self.eval_optional(*p, offset),
            ParserNode::ZeroOrMore(p) => self.eval_zero_or_more(*p, offset),
            ParserNode::Atomic(p) => self.eval_atomic(*p, offset),
            ParserNode::Tag(tag, p) => self.eval_tag(*tag, *p, offset),
            ParserNode::RuleRef(rule_id) => self.eval_rule(*rule_id, offset),
        }
    }

    fn eval_literal(&mut self, s: &str, offset: usize) -> Verdict {
        let input = self.input;
        let end = offset.saturating_add(s.len());
        if end <= input.len() {
            if &input[offset..end] == s {
                Verdict::Success(EvalOk::confirmed(end, vec![]))
            } else {
                Verdict::Fail
            }
        } else {
            let avail = &input[offset.min(input.len())..];
            if s.starts_with(avail) {
                if self.end_is_final {
                    Verdict::Fail
                } else {
                    Verdict::NeedMoreInput
                }
            } else {
                Verdict::Fail
            }
        }
    }

    fn eval_chars(&mut self, class: &CharClass, offset: usize) -> Verdict {
        let input = self.input;
        if offset >= input.len() {
            return if self.end_is_final {
                Verdict::Fail
            } else {
                Verdict::NeedMoreInput
            };
        }
        let c = input[offset..].chars().next().expect("offset < len implies a char");
        if class.matches(c) {
            Verdict::Success(EvalOk::confirmed(offset + c.len_utf8(), vec![]))
        } else {
            Verdict::Fail
        }
    }

    fn eval_until(&mut self, rx: &CommonRegex, offset: usize) -> Verdict {
        let input = self.input;
        match rx.search_match(&input[offset..]) {
            Some((pos, _end, is_partial)) => Verdict::Success(EvalOk {
                end: offset + pos,
                children: vec![],
                partial_terminal: is_partial,
            }),
            None => {
                if self.end_is_final {
                    Verdict::Success(EvalOk::confirmed(input.len(), vec![]))
                } else {
                    Verdict::NeedMoreInput
                }
            }
        }
    }

    fn eval_preserved(&mut self, s: &str, token_id: u32, offset: usize) -> Verdict {
        let Some(spans) = self.token_spans else {
            return self.eval_literal(s, offset);
        };
        match spans.iter().find(|sp| sp.start == offset) {
            None => Verdict::Fail,
            Some(sp) => {
                if sp.token_id != token_id {
                    return Verdict::Fail;
                }
                if sp.end > self.input.len() {
                    return if self.end_is_final {
                        Verdict::Fail
                    } else {
                        Verdict::NeedMoreInput
                    };
                }
                if &self.input[sp.start..sp.end] == s {
                    Verdict::Success(EvalOk::confirmed(sp.end, vec![]))
                } else {
                    Verdict::Fail
                }
            }
        }
    }

    fn eval_seq(&mut self, parts: &[ParserId], offset: usize) -> Verdict {
        let marker = self.arena.len();
        let mut cur = offset;
        let mut children = Vec::new();
        let mut partial_terminal = false;
        for &p in parts {
            match self.eval(p, cur) {
                Verdict::Success(ok) => {
                    cur = ok.end;
                    partial_terminal = ok.partial_terminal;
                    children.extend(ok.children);
                }
                Verdict::Fail => {
                    self.arena.truncate(marker);
                    return Verdict::Fail;
                }
                Verdict::NeedMoreInput => {
                    self.arena.truncate(marker);
                    return Verdict::NeedMoreInput;
                }
            }
        }
        Verdict::Success(EvalOk {
            end: cur,
            children,
            partial_terminal,
        })
    }

    fn eval_alt(&mut self, parts: &[ParserId], offset: usize) -> Verdict {
        let marker = self.arena.len();
        let mut saw_need_more = false;
        for &p in parts {
            match self.eval(p, offset) {
                Verdict::Success(ok) => return Verdict::Success(ok),
                Verdict::Fail => self.arena.truncate(marker),
                Verdict::NeedMoreInput => {
                    self.arena.truncate(marker);
                    saw_need_more = true;
                }
            }
        }
        if saw_need_more {
            Verdict::NeedMoreInput
        } else {
            Verdict::Fail
        }
    }

    fn eval_optional(&mut self, p: ParserId, offset: usize) -> Verdict {
        let marker = self.arena.len();
        match self.eval(p, offset) {
            Verdict::Success(ok) => Verdict::Success(ok),
            Verdict::Fail => {
                self.arena.truncate(marker);
                Verdict::Success(EvalOk::confirmed(offset, vec![]))
            }
            Verdict::NeedMoreInput => {
                self.arena.truncate(marker);
                Verdict::NeedMoreInput
            }
        }
    }

    fn eval_zero_or_more(&mut self, p: ParserId, offset: usize) -> Verdict {
        let mut cur = offset;
        let mut children = Vec::new();
        let mut partial_terminal = false;
        loop {
            let marker = self.arena.len();
            match self.eval(p, cur) {
                Verdict::Success(ok) => {
                    if ok.end == cur && ok.children.is_empty() {
                        // Zero-width match contributing nothing: stop, or an
                        // always-succeeding inner parser would loop forever.
                        self.arena.truncate(marker);
                        break;
                    }
                    cur = ok.end;
                    partial_terminal = ok.partial_terminal;
                    children.extend(ok.children);
                }
                Verdict::Fail => {
                    self.arena.truncate(marker);
                    break;
                }
                Verdict::NeedMoreInput => {
                    self.arena.truncate(marker);
                    return Verdict::NeedMoreInput;
                }
            }
        }
        Verdict::Success(EvalOk {
            end: cur,
            children,
            partial_terminal,
        })
    }

    /// `atomic()`'s "outermost scope" is read as "this parse is known final"
    /// (`end_is_final`), not as atomic-nesting depth: `NeedMoreInput` is only
    /// a meaningful verdict when more bytes might still arrive, so once the
    /// stream is final the only sensible resolution for a lingering partial
    /// node is to erase it and fail.
    fn eval_atomic(&mut self, p: ParserId, offset: usize) -> Verdict {
        let marker = self.arena.len();
        match self.eval(p, offset) {
            Verdict::Success(ok) => {
                let has_partial = (marker..self.arena.len()).any(|i| self.arena.get(i).is_partial);
                if has_partial {
                    self.arena.truncate(marker);
                    if self.end_is_final {
                        Verdict::Fail
                    } else {
                        Verdict::NeedMoreInput
                    }
                } else {
                    Verdict::Success(ok)
                }
            }
            other => {
                self.arena.truncate(marker);
                other
            }
        }
    }

    fn eval_tag(&mut self, tag: Tag, p: ParserId, offset: usize) -> Verdict {
        let marker = self.arena.len();
        match self.eval(p, offset) {
            Verdict::Success(ok) => {
                let is_partial = ok.end == self.input.len() && !self.end_is_final && ok.partial_terminal;
                let node = AstNode {
                    tag,
                    span: offset..ok.end,
                    is_partial,
                    children: ok.children,
                };
                let idx = self.arena.push(node);
                Verdict::Success(EvalOk {
                    end: ok.end,
                    children: vec![idx],
                    partial_terminal: ok.partial_terminal,
                })
            }
            other => {
                self.arena.truncate(marker);
                other
            }
        }
    }

    fn eval_rule(&mut self, rule_id: RuleId, offset: usize) -> Verdict {
        if let Some(entry) = self.memo.get(&(rule_id, offset)).cloned() {
            return match entry {
                CacheEntry::Success(cached) => Verdict::Success(cached.replay(&mut self.arena)),
                CacheEntry::Fail => Verdict::Fail,
                CacheEntry::NeedMoreInput => Verdict::NeedMoreInput,
            };
        }
        if !self.in_progress.insert((rule_id, offset)) {
            // Left-recursive cycle: fail the inner (re-entrant) invocation
            // only. Not cached — the outer invocation this cycle unwinds
            // into may still succeed via a different alternative.
            return Verdict::Fail;
        }
        let marker = self.arena.len();
        let body = self.grammar.rules[rule_id];
        let verdict = self.eval(body, offset);
        self.in_progress.remove(&(rule_id, offset));

        let cache_entry = match &verdict {
            Verdict::Success(ok) => CacheEntry::Success(CachedSuccess::capture(&self.arena, marker, ok)),
            Verdict::Fail => CacheEntry::Fail,
            Verdict::NeedMoreInput => CacheEntry::NeedMoreInput,
        };
        self.memo.insert((rule_id, offset), cache_entry);
        verdict
    }
}

impl Grammar {
    /// Runs one parse attempt, returning the arena of AST nodes created
    /// alongside the verdict. Re-running with a longer `input` (same
    /// `end_is_final` semantics) is the streaming model: there is no
    /// persistent state across calls beyond what the caller threads through.
    pub fn parse(&self, context: ParseContext) -> (Arena, ParseResult) {
        let mut evaluator = Evaluator {
            grammar: self,
            input: context.input,
            end_is_final: context.end_is_final,
            token_spans: context.token_spans,
            arena: Arena::new(),
            memo: HashMap::new(),
            in_progress: HashSet::new(),
        };
        let verdict = evaluator.eval(self.root, 0);
        let result = match verdict {
            Verdict::Success(ok) => ParseResult::Success {
                end: ok.end,
                roots: ok.children,
            },
            Verdict::Fail => ParseResult::Fail,
            Verdict::NeedMoreInput => ParseResult::NeedMoreInput,
        };
        (evaluator.arena, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_scenario_partial_sequence() {
        let mut b = GrammarBuilder::new();
        let open = b.literal("<think>");
        let close = b.literal("</think>");
        let root = b.seq([open, close]);
        b.set_root(root);
        let g = b.build().unwrap();

        let (_, r) = g.parse(ParseContext::new("<thi", false));
        assert_eq!(r, ParseResult::NeedMoreInput);

        let (_, r) = g.parse(ParseContext::new("<think></", false));
        assert_eq!(r, ParseResult::NeedMoreInput);

        let (_, r) = g.parse(ParseContext::new("<think></think>", false));
        assert_eq!(r, ParseResult::Success { end: 15, roots: vec![] });
    }

    fn recursive_list_grammar() -> Grammar {
        let mut b = GrammarBuilder::new();
        let number_body = b.chars("[0-9]").unwrap();
        b.rule("number", number_body);
        let open = b.literal("[");
        let value_ref = b.r#ref("value");
        let close = b.literal("]");
        let list_body = b.seq([open, value_ref, close]);
        b.rule("list", list_body);
        let number_ref = b.r#ref("number");
        let list_ref = b.r#ref("list");
        let value_body = b.alt([number_ref, list_ref]);
        let value = b.rule("value", value_body);
        b.set_root(value);
        b.build().unwrap()
    }

    #[test]
    fn boundary_scenario_recursive_list_success() {
        let g = recursive_list_grammar();
        let (_, r) = g.parse(ParseContext::new("[[[3]]]", true));
        assert!(matches!(r, ParseResult::Success { end: 7, .. }));
    }

    #[test]
    fn boundary_scenario_recursive_list_fail_when_final() {
        let g = recursive_list_grammar();
        let (_, r) = g.parse(ParseContext::new("[[", true));
        assert_eq!(r, ParseResult::Fail);
    }

    #[test]
    fn boundary_scenario_recursive_list_need_more_when_streaming() {
        let g = recursive_list_grammar();
        let (_, r) = g.parse(ParseContext::new("[[", false));
        assert_eq!(r, ParseResult::NeedMoreInput);
    }

    #[test]
    fn boundary_scenario_recursive_list_rejects_non_digit() {
        let g = recursive_list_grammar();
        let (_, r) = g.parse(ParseContext::new("[a]", true));
        assert_eq!(r, ParseResult::Fail);
    }

    #[test]
    fn success_stability_under_prefix_extension() {
        let g = recursive_list_grammar();
        let (_, short) = g.parse(ParseContext::new("[3]", false));
        let (_, longer) = g.parse(ParseContext::new("[3] trailing garbage is fine", false));
        assert_eq!(short, ParseResult::Success { end: 3, roots: vec![] });
        assert_eq!(longer, ParseResult::Success { end: 3, roots: vec![] });
    }

    #[test]
    fn tag_wraps_matched_span_and_flows_up_as_a_child() {
        let mut b = GrammarBuilder::new();
        let digit = b.chars("[0-9]").unwrap();
        let tagged = b.tag(Tag::Content, digit);
        b.set_root(tagged);
        let g = b.build().unwrap();

        let (arena, r) = g.parse(ParseContext::new("7", true));
        let roots = r.roots();
        assert_eq!(roots.len(), 1);
        let node = arena.get(roots[0]);
        assert_eq!(node.tag, Tag::Content);
        assert_eq!(node.text("7"), "7");
        assert!(!node.is_partial);
    }

    #[test]
    fn until_leaf_reports_partial_boundary_on_unconfirmed_delimiter() {
        let mut b = GrammarBuilder::new();
        let content = b.until("</think>").unwrap();
        let tagged = b.tag(Tag::Content, content);
        b.set_root(tagged);
        let g = b.build().unwrap();

        let (arena, r) = g.parse(ParseContext::new("hello </th", false));
        let roots = r.roots();
        assert_eq!(roots.len(), 1);
        let node = arena.get(roots[0]);
        assert_eq!(node.text("hello </th"), "hello ");
        assert!(node.is_partial);
    }

    #[test]
    fn until_leaf_is_confirmed_once_delimiter_found() {
        let mut b = GrammarBuilder::new();
        let content = b.until("</think>").unwrap();
        let tagged = b.tag(Tag::Content, content);
        b.set_root(tagged);
        let g = b.build().unwrap();

        let (arena, r) = g.parse(ParseContext::new("hello </think>", false));
        let node = arena.get(r.roots()[0]);
        assert_eq!(node.text("hello </think>"), "hello ");
        assert!(!node.is_partial);
    }

    #[test]
    fn atomic_erases_partial_match_once_stream_is_final() {
        let mut b = GrammarBuilder::new();
        let content = b.until("</think>").unwrap();
        let tagged = b.tag(Tag::Content, content);
        let wrapped = b.atomic(tagged);
        b.set_root(wrapped);
        let g = b.build().unwrap();

        let (arena, r) = g.parse(ParseContext::new("hello </th", true));
        assert_eq!(r, ParseResult::Fail);
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn atomic_yields_need_more_input_while_streaming() {
        let mut b = GrammarBuilder::new();
        let content = b.until("</think>").unwrap();
        let tagged = b.tag(Tag::Content, content);
        let wrapped = b.atomic(tagged);
        b.set_root(wrapped);
        let g = b.build().unwrap();

        let (_, r) = g.parse(ParseContext::new("hello </th", false));
        assert_eq!(r, ParseResult::NeedMoreInput);
    }

    #[test]
    fn undefined_rule_reference_fails_to_build() {
        let mut b = GrammarBuilder::new();
        let dangling = b.r#ref("never-defined");
        b.set_root(dangling);
        assert!(matches!(b.build(), Err(Error::InvalidGrammar(_))));
    }

    #[test]
    fn one_or_more_requires_at_least_one_match() {
        let mut b = GrammarBuilder::new();
        let digit = b.chars("[0-9]").unwrap();
        let digits = b.one_or_more(digit);
        b.set_root(digits);
        let g = b.build().unwrap();

        let (_, r) = g.parse(ParseContext::new("123", true));
        assert_eq!(r, ParseResult::Success { end: 3, roots: vec![] });

        let (_, r) = g.parse(ParseContext::new("", true));
        assert_eq!(r, ParseResult::Fail);
    }
}
