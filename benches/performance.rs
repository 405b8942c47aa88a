use chat_peg_parser::ast::Tag;
use chat_peg_parser::json_partial;
use chat_peg_parser::peg::{GrammarBuilder, ParseContext};
use chat_peg_parser::regex_partial::CommonRegex;
use chat_peg_parser::template::{render, Context as TemplateContext, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn build_sample_grammar() -> chat_peg_parser::peg::Grammar {
    let mut g = GrammarBuilder::new();
    let reasoning = g.until("</think>").unwrap();
    let reasoning = g.tag(Tag::Reasoning, reasoning);
    let think_close = g.literal("</think>");
    let think_open = g.literal("<think>");
    let think_block = g.seq(vec![think_open, reasoning, think_close]);
    let think_block = g.tag(Tag::ReasoningBlock, think_block);
    let think_block = g.optional(think_block);

    let content = g.until("<tool_call>").unwrap();
    let content = g.tag(Tag::Content, content);

    let id = g.until("</id>").unwrap();
    let id = g.tag(Tag::ToolId, id);
    let id_close = g.literal("</id>");
    let id_part = g.seq(vec![id, id_close]);
    let id_part = g.optional(id_part);

    let name = g.until(" ").unwrap();
    let name = g.tag(Tag::ToolName, name);
    let sep = g.literal(" ");

    let args = g.until("</tool_call>").unwrap();
    let args = g.tag(Tag::ToolArgs, args);

    let tool_open = g.literal("<tool_call>");
    let tool_close = g.literal("</tool_call>");
    let tool = g.seq(vec![tool_open, id_part, name, sep, args, tool_close]);
    let tool = g.tag(Tag::Tool, tool);
    let tool = g.optional(tool);

    let body = g.seq(vec![think_block, content, tool]);
    g.set_root(body);
    g.build().unwrap()
}

fn sample_text(tool_calls: usize) -> String {
    let mut s = String::from("<think>considering the request</think>here is some assistant text ");
    for i in 0..tool_calls {
        s.push_str(&format!("<tool_call><id>call_{i}</id>lookup {{\"q\":\"item {i}\"}}</tool_call>"));
    }
    s
}

fn bench_grammar_parse_by_length(c: &mut Criterion) {
    let grammar = build_sample_grammar();
    let mut group = c.benchmark_group("grammar_parse_by_length");

    for tool_calls in [1usize, 5, 20, 50].iter() {
        let text = sample_text(*tool_calls);
        group.bench_with_input(BenchmarkId::from_parameter(tool_calls), &text, |b, text| {
            b.iter(|| grammar.parse(ParseContext::new(black_box(text), true)));
        });
    }

    group.finish();
}

fn bench_grammar_parse_streaming(c: &mut Criterion) {
    let grammar = build_sample_grammar();
    let text = sample_text(10);
    let mut group = c.benchmark_group("grammar_parse_streaming");

    group.bench_function("reparse_on_every_chunk", |b| {
        b.iter(|| {
            for end in (10..=text.len()).step_by(7) {
                let _ = grammar.parse(ParseContext::new(black_box(&text[..end]), end == text.len()));
            }
        });
    });

    group.finish();
}

fn bench_common_regex_search(c: &mut Criterion) {
    let rx = CommonRegex::new("</tool_call>", false).unwrap();
    let mut group = c.benchmark_group("common_regex_search");

    for size in [32usize, 256, 2048].iter() {
        let haystack = format!("{}{}", "x".repeat(*size), "</tool_call>");
        group.bench_with_input(BenchmarkId::from_parameter(size), &haystack, |b, h| {
            b.iter(|| rx.search(black_box(h)));
        });
    }

    group.finish();
}

fn bench_json_heal(c: &mut Criterion) {
    let mut group = c.benchmark_group("json_heal");

    let truncations = [
        r#"{"q":"item","nested":{"a":1,"b":[1,2,3"#,
        r#"{"a":1,"b":2,"c":{"d":[1,2,{"e":"f"#,
    ];

    for (i, src) in truncations.iter().enumerate() {
        group.bench_with_input(BenchmarkId::from_parameter(i), src, |b, src| {
            b.iter(|| match json_partial::parse(black_box(src)) {
                json_partial::ParseOutcome::Partial(p) => p.heal("\u{2603}").ok(),
                _ => None,
            });
        });
    }

    group.finish();
}

fn bench_template_render(c: &mut Criterion) {
    let ctx = TemplateContext::new();
    ctx.insert(
        "messages",
        Value::array((0..50).map(|i| Value::from(format!("message {i}"))).collect()),
    );
    let tpl = "{% for m in messages %}{{ m }}\n{% endfor %}";

    c.bench_function("template_render_50_messages", |b| {
        b.iter(|| render(black_box(tpl), black_box(&ctx)));
    });
}

criterion_group!(
    benches,
    bench_grammar_parse_by_length,
    bench_grammar_parse_streaming,
    bench_common_regex_search,
    bench_json_heal,
    bench_template_render,
);
criterion_main!(benches);
