//! # chat-peg-parser
//!
//! A streaming PEG combinator engine for turning raw model decode text into
//! structured chat messages — content, reasoning, and tool calls — as tokens
//! arrive, plus the three collaborators it leans on: a regex engine with
//! partial-match awareness, a truncated-JSON healer, and a small template
//! evaluator and JSON-RPC subprocess client for the surrounding chat
//! pipeline.
//!
//! ## Key properties
//!
//! - **Streaming-aware**: every parse takes the input available so far and
//!   reports `Success`, `Fail`, or `NeedMoreInput` — there's no separate
//!   "streaming mode", the same grammar just gets re-evaluated as more bytes
//!   arrive.
//! - **Partial-match regex**: the `until(...)` leaf recognizes a delimiter
//!   that's still in the middle of matching, rather than either blocking on
//!   it or swallowing it as content.
//! - **JSON healing**: a truncated JSON argument blob (as a streaming tool
//!   call naturally produces) can be turned into a valid, complete value.
//! - **Caller-defined syntax**: this crate has no built-in notion of
//!   `<think>` tags or any particular tool-call delimiter. A grammar is
//!   built with [`peg::GrammarBuilder`] and a [`mappers::Mapper`]
//!   implementation walks the resulting AST into a [`chat::ChatMessage`].
//!
//! ## Example
//!
//! ```rust
//! use chat_peg_parser::ast::Tag;
//! use chat_peg_parser::chat::{apply_mapper, build_chat_parser, ChatMessage};
//! use chat_peg_parser::mappers::BaseMapper;
//! use chat_peg_parser::peg::ParseContext;
//!
//! # fn main() -> chat_peg_parser::error::Result<()> {
//! let grammar = build_chat_parser(|g| {
//!     let content = g.until("<|end|>").unwrap();
//!     let content = g.tag(Tag::Content, content);
//!     let end = g.literal("<|end|>");
//!     let body = g.seq(vec![content, end]);
//!     g.set_root(body);
//! })?;
//!
//! let (arena, result) = grammar.parse(ParseContext::new("hello there<|end|>", true));
//! let mut message = ChatMessage::default();
//! apply_mapper(&mut BaseMapper, &arena, &result, "hello there<|end|>", &mut message)?;
//! assert_eq!(message.content, "hello there");
//! # Ok(())
//! # }
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// The tagged AST arena produced by a PEG parse: [`ast::Tag`], [`ast::AstNode`],
/// [`ast::Arena`], and the [`ast::TokenSpan`] type consumed by the `preserved`
/// leaf.
pub mod ast;

/// Bracket-syntax character classes (`chars("[0-9]")`) used by the PEG
/// engine's `chars` leaf.
pub mod charclass;

/// Error types and the crate-wide `Result<T>` alias.
pub mod error;

/// A regex engine wrapper that additionally compiles a reversed-partial
/// pattern, letting a caller recognize a delimiter that's still in the
/// middle of matching at the end of the currently available input.
pub mod regex_partial;

/// SAX-style parsing and healing of a JSON value truncated mid-stream.
pub mod json_partial;

/// The streaming PEG combinator engine: [`peg::GrammarBuilder`],
/// [`peg::Grammar`], [`peg::ParseContext`] and [`peg::ParseResult`].
pub mod peg;

/// AST-to-[`chat::ChatMessage`] visitors for the two tool-call syntaxes this
/// crate supports out of the box (a single JSON-args blob, or individually
/// tagged arguments assembled into JSON incrementally).
pub mod mappers;

/// The chat message data model ([`chat::ChatMessage`], [`chat::ToolCall`])
/// and the glue between a built grammar and a mapper.
pub mod chat;

/// A small Jinja-like template evaluator used to render chat prompts from a
/// model's own chat template.
pub mod template;

/// Line-delimited JSON-RPC over a child process's stdio.
pub mod rpc;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

pub use error::{Error, Result};

pub use ast::{Arena, AstNode, Tag, TokenSpan};
pub use peg::{Grammar, GrammarBuilder, ParseContext, ParseResult};

pub use chat::{apply_mapper, build_chat_parser, ChatMessage, ToolCall};
pub use mappers::{BaseMapper, ConstructedMapper, Mapper, NativeMapper};

pub use charclass::CharClass;
pub use regex_partial::{CommonRegex, RegexMatch};

pub use json_partial::{Healed, LocationFlags, Partial, ParseOutcome};

pub use template::{Context as TemplateContext, Value as TemplateValue};

pub use rpc::RpcHandle;

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The most commonly used types and functions for parsing streamed chat
/// output into a [`ChatMessage`]. Import with
/// `use chat_peg_parser::prelude::*;`.
pub mod prelude {
    pub use crate::{
        apply_mapper, build_chat_parser, ast::Tag, BaseMapper, ChatMessage, CommonRegex,
        ConstructedMapper, Error, Grammar, GrammarBuilder, Mapper, NativeMapper, ParseContext,
        ParseResult, Result, ToolCall,
    };
}
