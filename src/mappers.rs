//! AST → chat-message mappers: visitors that walk an AST arena in document
//! order and assemble a [`ChatMessage`].
//!
//! Each tag gets exactly one handler and errors propagate through `Result`
//! rather than unwinding, so a malformed tag sequence becomes a returned
//! error instead of a panic.

use crate::ast::{AstNode, Tag};
use crate::chat::{ChatMessage, ToolCall};
use crate::error::{Error, Result};

/// A visitor over one AST node. Implementations hold whatever running state
/// their tag syntax needs (e.g. "which tool call is currently open").
pub trait Mapper {
    fn visit(&mut self, node: &AstNode, input: &str, message: &mut ChatMessage) -> Result<()>;
}

/// Handles the tags every mapper shares. Returns `Ok(true)` if `node`'s tag
/// was one of them, `Ok(false)` otherwise so the caller can fall through to
/// its own tag-specific handling.
fn apply_base(node: &AstNode, input: &str, message: &mut ChatMessage) -> bool {
    match node.tag {
        Tag::None => true,
        Tag::Reasoning => {
            message.reasoning.push_str(node.text(input).trim_end());
            true
        }
        Tag::Content => {
            message.content.push_str(node.text(input));
            true
        }
        _ => false,
    }
}

fn strip_json_quotes(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// The minimum mapper: content and reasoning only. Reused by
/// [`NativeMapper`] and [`ConstructedMapper`] for their shared tags, and
/// usable standalone for grammars with no tool-call syntax at all.
#[derive(Debug, Default)]
pub struct BaseMapper;

impl Mapper for BaseMapper {
    fn visit(&mut self, node: &AstNode, input: &str, message: &mut ChatMessage) -> Result<()> {
        if apply_base(node, input, message) {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "base mapper received unexpected tag: {}",
                node.tag
            )))
        }
    }
}

/// Tool arguments arrive as a single complete JSON string from the model.
/// Tracks the tool call currently being assembled and a buffered id that may
/// arrive before the name that creates the tool call.
#[derive(Debug, Default)]
pub struct NativeMapper {
    current_tool: Option<usize>,
    pending_id: String,
}

impl NativeMapper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mapper for NativeMapper {
    fn visit(&mut self, node: &AstNode, input: &str, message: &mut ChatMessage) -> Result<()> {
        if apply_base(node, input, message) {
            return Ok(());
        }
        match node.tag {
            Tag::ToolOpen => {
                self.current_tool = None;
                self.pending_id.clear();
                Ok(())
            }
            Tag::ToolId => {
                if node.is_partial {
                    return Ok(());
                }
                let id = strip_json_quotes(node.text(input));
                match self.current_tool {
                    // A tool call is already open: apply directly rather
                    // than buffering, for syntaxes where the id trails the
                    // name instead of leading it.
                    Some(idx) => message.tool_calls[idx].id = Some(id),
                    None => self.pending_id = id,
                }
                Ok(())
            }
            Tag::ToolName => {
                if node.is_partial {
                    return Ok(());
                }
                let id = if self.pending_id.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut self.pending_id))
                };
                let idx = message.tool_calls.len();
                message.tool_calls.push(ToolCall {
                    id,
                    name: node.text(input).to_string(),
                    arguments: String::new(),
                });
                self.current_tool = Some(idx);
                Ok(())
            }
            Tag::ToolArgs => {
                let idx = self
                    .current_tool
                    .ok_or_else(|| Error::bad_state("TOOL_ARGS seen with no open tool call"))?;
                message.tool_calls[idx].arguments.push_str(node.text(input).trim_end());
                Ok(())
            }
            Tag::ToolClose | Tag::Tool | Tag::ReasoningBlock => Ok(()),
            other => Err(Error::internal(format!(
                "native mapper received unexpected tag: {other}"
            ))),
        }
    }
}

/// The model emits `name=value` argument pairs instead of a JSON object;
/// this mapper assembles a JSON object incrementally as those pieces
/// arrive. `needs_closing_quote` tracks a string value left open so a
/// streamed continuation of it can still append characters.
#[derive(Debug, Default)]
pub struct ConstructedMapper {
    current_tool: Option<usize>,
    arg_count: usize,
    needs_closing_quote: bool,
}

impl ConstructedMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn open_tool(&self) -> Result<usize> {
        self.current_tool
            .ok_or_else(|| Error::bad_state("constructed mapper tag seen with no open tool call"))
    }
}

impl Mapper for ConstructedMapper {
    fn visit(&mut self, node: &AstNode, input: &str, message: &mut ChatMessage) -> Result<()> {
        if apply_base(node, input, message) {
            return Ok(());
        }
        match node.tag {
            Tag::ToolName => {
                if node.is_partial {
                    return Ok(());
                }
                let idx = message.tool_calls.len();
                message.tool_calls.push(ToolCall {
                    id: None,
                    name: node.text(input).to_string(),
                    arguments: "{".to_string(),
                });
                self.current_tool = Some(idx);
                self.arg_count = 0;
                self.needs_closing_quote = false;
                Ok(())
            }
            Tag::ToolArgOpen => {
                self.needs_closing_quote = false;
                Ok(())
            }
            Tag::ToolArgName => {
                if node.is_partial {
                    return Ok(());
                }
                let idx = self.open_tool()?;
                let key = serde_json::to_string(node.text(input))?;
                let args = &mut message.tool_calls[idx].arguments;
                if self.arg_count > 0 {
                    args.push(',');
                }
                args.push_str(&key);
                args.push(':');
                self.arg_count += 1;
                Ok(())
            }
            Tag::ToolArgStringValue => {
                let idx = self.open_tool()?;
                let quoted = serde_json::to_string(node.text(input).trim())?;
                // Drop the trailing `"`: a streamed continuation of this
                // value appends more characters before it is ever added back.
                message.tool_calls[idx].arguments.push_str(&quoted[..quoted.len() - 1]);
                self.needs_closing_quote = true;
                Ok(())
            }
            Tag::ToolArgClose => {
                if self.needs_closing_quote {
                    let idx = self.open_tool()?;
                    message.tool_calls[idx].arguments.push('"');
                    self.needs_closing_quote = false;
                }
                Ok(())
            }
            Tag::ToolArgJsonValue => {
                let idx = self.open_tool()?;
                message.tool_calls[idx].arguments.push_str(node.text(input));
                Ok(())
            }
            Tag::ToolClose => {
                if node.is_partial {
                    return Ok(());
                }
                let idx = self.open_tool()?;
                if self.needs_closing_quote {
                    message.tool_calls[idx].arguments.push('"');
                    self.needs_closing_quote = false;
                }
                message.tool_calls[idx].arguments.push('}');
                self.current_tool = None;
                Ok(())
            }
            Tag::Tool | Tag::ReasoningBlock => Ok(()),
            other => Err(Error::internal(format!(
                "constructed mapper received unexpected tag: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Arena;

    fn leaf(arena: &mut Arena, tag: Tag, span: std::ops::Range<usize>, is_partial: bool) -> usize {
        arena.push(AstNode {
            tag,
            span,
            is_partial,
            children: vec![],
        })
    }

    #[test]
    fn boundary_scenario_native_mapper_single_tool_call() {
        // TOOL_OPEN, TOOL_ID("\"abc\""), TOOL_NAME("get_weather"), TOOL_ARGS(...), TOOL_CLOSE
        let input = "x\"abc\"get_weather{\"city\":\"Paris\"}y";
        let mut arena = Arena::new();
        let open = leaf(&mut arena, Tag::ToolOpen, 0..0, false);
        let id = leaf(&mut arena, Tag::ToolId, 1..6, false);
        let name = leaf(&mut arena, Tag::ToolName, 6..17, false);
        let args = leaf(&mut arena, Tag::ToolArgs, 17..34, false);
        let close = leaf(&mut arena, Tag::ToolClose, 34..34, false);
        let mut mapper = NativeMapper::new();
        let mut message = ChatMessage::default();
        for idx in [open, id, name, args, close] {
            mapper.visit(arena.get(idx), input, &mut message).unwrap();
        }
        assert_eq!(message.tool_calls.len(), 1);
        let tc = &message.tool_calls[0];
        assert_eq!(tc.id.as_deref(), Some("abc"));
        assert_eq!(tc.name, "get_weather");
        assert_eq!(tc.arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn native_mapper_partial_tool_name_creates_no_tool_call() {
        let input = "get_weath";
        let mut arena = Arena::new();
        let name = leaf(&mut arena, Tag::ToolName, 0..9, true);
        let mut mapper = NativeMapper::new();
        let mut message = ChatMessage::default();
        mapper.visit(arena.get(name), input, &mut message).unwrap();
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn native_mapper_applies_trailing_id_to_open_tool_call() {
        let input = "get_weather\"abc\"";
        let mut arena = Arena::new();
        let name = leaf(&mut arena, Tag::ToolName, 0..11, false);
        let id = leaf(&mut arena, Tag::ToolId, 11..16, false);
        let mut mapper = NativeMapper::new();
        let mut message = ChatMessage::default();
        mapper.visit(arena.get(name), input, &mut message).unwrap();
        mapper.visit(arena.get(id), input, &mut message).unwrap();
        assert_eq!(message.tool_calls[0].id.as_deref(), Some("abc"));
    }

    #[test]
    fn boundary_scenario_constructed_mapper_single_argument() {
        let input = "get_weathercityParis";
        let mut arena = Arena::new();
        let name = leaf(&mut arena, Tag::ToolName, 0..11, false);
        let arg_open = leaf(&mut arena, Tag::ToolArgOpen, 11..11, false);
        let arg_name = leaf(&mut arena, Tag::ToolArgName, 11..15, false);
        let arg_value = leaf(&mut arena, Tag::ToolArgStringValue, 15..20, false);
        let arg_close = leaf(&mut arena, Tag::ToolArgClose, 20..20, false);
        let close = leaf(&mut arena, Tag::ToolClose, 20..20, false);
        let mut mapper = ConstructedMapper::new();
        let mut message = ChatMessage::default();
        for idx in [name, arg_open, arg_name, arg_value, arg_close, close] {
            mapper.visit(arena.get(idx), input, &mut message).unwrap();
        }
        assert_eq!(message.tool_calls[0].arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn boundary_scenario_constructed_mapper_partial_close_leaves_string_open() {
        let input = "get_weathercityParis";
        let mut arena = Arena::new();
        let name = leaf(&mut arena, Tag::ToolName, 0..11, false);
        let arg_open = leaf(&mut arena, Tag::ToolArgOpen, 11..11, false);
        let arg_name = leaf(&mut arena, Tag::ToolArgName, 11..15, false);
        let arg_value = leaf(&mut arena, Tag::ToolArgStringValue, 15..20, false);
        let close = leaf(&mut arena, Tag::ToolClose, 20..20, true);
        let mut mapper = ConstructedMapper::new();
        let mut message = ChatMessage::default();
        for idx in [name, arg_open, arg_name, arg_value, close] {
            mapper.visit(arena.get(idx), input, &mut message).unwrap();
        }
        assert_eq!(message.tool_calls[0].arguments, "{\"city\":\"Paris");
    }

    #[test]
    fn constructed_mapper_multiple_arguments_are_comma_separated() {
        let input = "convertfromUSDtoEUR";
        let mut arena = Arena::new();
        let name = leaf(&mut arena, Tag::ToolName, 0..7, false);
        let arg1_name = leaf(&mut arena, Tag::ToolArgName, 7..11, false);
        let arg1_value = leaf(&mut arena, Tag::ToolArgStringValue, 11..14, false);
        let arg1_close = leaf(&mut arena, Tag::ToolArgClose, 14..14, false);
        let arg2_name = leaf(&mut arena, Tag::ToolArgName, 14..16, false);
        let arg2_value = leaf(&mut arena, Tag::ToolArgStringValue, 16..19, false);
        let arg2_close = leaf(&mut arena, Tag::ToolArgClose, 19..19, false);
        let close = leaf(&mut arena, Tag::ToolClose, 19..19, false);
        let mut mapper = ConstructedMapper::new();
        let mut message = ChatMessage::default();
        for idx in [name, arg1_name, arg1_value, arg1_close, arg2_name, arg2_value, arg2_close, close] {
            mapper.visit(arena.get(idx), input, &mut message).unwrap();
        }
        assert_eq!(message.tool_calls[0].arguments, "{\"from\":\"USD\",\"to\":\"EUR\"}");
    }

    #[test]
    fn base_mapper_trims_reasoning_but_not_content() {
        let input = "thinking...   visible text   ";
        let mut arena = Arena::new();
        let reasoning = leaf(&mut arena, Tag::Reasoning, 0..14, false);
        let content = leaf(&mut arena, Tag::Content, 14..29, false);
        let mut mapper = BaseMapper;
        let mut message = ChatMessage::default();
        mapper.visit(arena.get(reasoning), input, &mut message).unwrap();
        mapper.visit(arena.get(content), input, &mut message).unwrap();
        assert_eq!(message.reasoning, "thinking...");
        assert_eq!(message.content, "visible text   ");
    }

    #[test]
    fn unexpected_tag_is_an_internal_error() {
        let mut arena = Arena::new();
        let node = leaf(&mut arena, Tag::ToolArgName, 0..0, false);
        let mut mapper = BaseMapper;
        let mut message = ChatMessage::default();
        assert!(matches!(
            mapper.visit(arena.get(node), "", &mut message),
            Err(Error::InternalError(_))
        ));
    }

    #[test]
    fn tool_args_without_open_tool_call_is_bad_state() {
        let mut arena = Arena::new();
        let node = leaf(&mut arena, Tag::ToolArgs, 0..0, false);
        let mut mapper = NativeMapper::new();
        let mut message = ChatMessage::default();
        assert!(matches!(
            mapper.visit(arena.get(node), "", &mut message),
            Err(Error::BadState(_))
        ));
    }
}
