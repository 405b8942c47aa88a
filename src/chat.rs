//! Chat message data model and the glue between a built [`Grammar`] and a
//! [`Mapper`].
//!
//! This crate does not hardcode one tag syntax: a model family's `<think>`
//! tags, tool-call delimiters and argument style are expressed by the
//! caller as an ordinary [`GrammarBuilder`] program. [`build_chat_parser`]
//! is a thin convenience wrapper around that, and [`apply_mapper`] is the
//! one function every caller needs regardless of which mapper variant
//! applies to their syntax.

use crate::ast::Arena;
use crate::error::Result;
use crate::mappers::Mapper;
use crate::peg::{Grammar, GrammarBuilder, ParseResult};

/// One tool call assembled by a [`Mapper`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    /// A JSON object, built either verbatim (native) or incrementally
    /// (constructed). May be a well-formed JSON *prefix* while streaming,
    /// never a malformed one.
    pub arguments: String,
}

/// The message a mapper assembles from one AST.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMessage {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Builds a grammar via an ordinary [`GrammarBuilder`] program supplied by
/// the caller. This is the whole of `build_chat_parser`: the chat-specific
/// part is entirely in how `configure` wires up `tag(Tag::..., ...)` nodes
/// for the caller's particular tool-call syntax.
pub fn build_chat_parser(configure: impl FnOnce(&mut GrammarBuilder)) -> Result<Grammar> {
    let mut builder = GrammarBuilder::new();
    configure(&mut builder);
    builder.build()
}

/// Runs `mapper` over every node reachable from `result`'s roots, in
/// document order, filling in `message`. `input` is the same string passed
/// to the [`crate::peg::ParseContext`] that produced `arena`/`result` — node
/// spans are offsets into it, not copies of the matched text.
///
/// The first mapper error aborts the walk and is returned; mapper errors are
/// programmer errors (grammar/mapper mismatch) and are fatal to the parse,
/// not something a caller recovers from node-by-node.
pub fn apply_mapper(
    mapper: &mut dyn Mapper,
    arena: &Arena,
    result: &ParseResult,
    input: &str,
    message: &mut ChatMessage,
) -> Result<()> {
    let mut first_error = None;
    arena.visit(result.roots(), &mut |node| {
        if first_error.is_some() {
            return;
        }
        if let Err(e) = mapper.visit(node, input, message) {
            first_error = Some(e);
        }
    });
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
