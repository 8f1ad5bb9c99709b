//! HTML markup parsing and serialization for note bodies.
//!
//! The durable `content` field of a note is a small HTML subset:
//!
//! ```html
//! <h1>Title</h1>
//! <p>Some <strong>bold</strong> text</p>
//! <ul><li>item<ul><li>nested</li></ul></li><li data-checked="true">done</li></ul>
//! <pre><code>let x = 1;</code></pre>
//! ```
//!
//! Elements outside the subset are transparent: their text is kept, their tag
//! is dropped. Mismatched or unterminated tags are errors, which callers treat
//! as malformed content.

use crate::block::{push_run, runs_text, BlockContent, BlockKind, InlineStyle, TextRun};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum MarkupError {
    #[error("Mismatched closing tag: expected </{expected}>, found </{found}>")]
    MismatchedTag { expected: String, found: String },

    #[error("Closing tag </{0}> has no opening tag")]
    UnexpectedClose(String),

    #[error("Unclosed tag <{0}>")]
    Unclosed(String),

    #[error("Malformed tag at byte {0}")]
    MalformedTag(usize),
}

pub type Result<T> = std::result::Result<T, MarkupError>;

/// Parse markup into block content.
pub fn parse(input: &str) -> Result<Vec<BlockContent>> {
    let nodes = build_tree(tokenize(input)?)?;
    let mut blocks = Vec::new();
    collect_blocks(&nodes, &mut blocks);
    Ok(blocks)
}

/// Serialize block content to markup.
pub fn write(blocks: &[BlockContent]) -> String {
    let mut out = String::new();
    write_blocks(blocks, &mut out);
    out
}

/// Plain text projection: one line per block, depth-first.
pub fn to_plain_text(blocks: &[BlockContent]) -> String {
    let mut lines = Vec::new();
    collect_lines(blocks, &mut lines);
    lines.join("\n")
}

/// Build one paragraph per line of plain text.
pub fn from_plain_text(text: &str) -> Vec<BlockContent> {
    text.lines().map(BlockContent::paragraph).collect()
}

fn collect_lines(blocks: &[BlockContent], lines: &mut Vec<String>) {
    for block in blocks {
        lines.push(block.text());
        collect_lines(&block.children, lines);
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, PartialEq)]
enum Token {
    Text(String),
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let mut text_start = 0;

    while pos < bytes.len() {
        if bytes[pos] != b'<' {
            pos += 1;
            continue;
        }

        let next = bytes.get(pos + 1).copied();
        let is_tag = matches!(next, Some(b'/') | Some(b'!') | Some(b'?'))
            || next.is_some_and(|b| b.is_ascii_alphabetic());
        if !is_tag {
            // Literal '<' in text
            pos += 1;
            continue;
        }

        if text_start < pos {
            tokens.push(Token::Text(decode_entities(&input[text_start..pos])));
        }

        if input[pos..].starts_with("<!--") {
            let end = input[pos + 4..]
                .find("-->")
                .ok_or(MarkupError::MalformedTag(pos))?;
            pos = pos + 4 + end + 3;
            text_start = pos;
            continue;
        }

        let end = find_tag_end(bytes, pos).ok_or(MarkupError::MalformedTag(pos))?;
        let inner = &input[pos + 1..end];

        match next {
            Some(b'!') | Some(b'?') => {}
            Some(b'/') => {
                let name = inner[1..].trim().to_ascii_lowercase();
                if name.is_empty() {
                    return Err(MarkupError::MalformedTag(pos));
                }
                tokens.push(Token::Close(name));
            }
            _ => tokens.push(parse_open_tag(inner)),
        }

        pos = end + 1;
        text_start = pos;
    }

    if text_start < bytes.len() {
        tokens.push(Token::Text(decode_entities(&input[text_start..])));
    }
    Ok(tokens)
}

/// Index of the `>` closing the tag that starts at `start`, skipping quoted values.
fn find_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn parse_open_tag(inner: &str) -> Token {
    let (inner, self_closing) = match inner.strip_suffix('/') {
        Some(rest) => (rest, true),
        None => (inner, false),
    };

    let name_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let name = inner[..name_end].to_ascii_lowercase();
    let mut attrs = Vec::new();
    let mut rest = inner[name_end..].trim_start();

    while !rest.is_empty() {
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = rest[..key_end].to_ascii_lowercase();
        rest = rest[key_end..].trim_start();

        let mut value = String::new();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            let quote = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'');
            match quote {
                Some(q) => {
                    let body = &after_eq[1..];
                    let close = body.find(q).unwrap_or(body.len());
                    value = decode_entities(&body[..close]);
                    rest = body.get(close + 1..).unwrap_or("");
                }
                None => {
                    let end = after_eq
                        .find(|c: char| c.is_whitespace())
                        .unwrap_or(after_eq.len());
                    value = decode_entities(&after_eq[..end]);
                    rest = &after_eq[end..];
                }
            }
        }

        if !key.is_empty() {
            attrs.push((key, value));
        }
        rest = rest.trim_start();
    }

    Token::Open {
        name,
        attrs,
        self_closing,
    }
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail[1..]
            .find(';')
            .filter(|semi| *semi <= 10)
            .and_then(|semi| decode_entity(&tail[1..semi + 1]).map(|c| (c, semi + 2)));

        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn escape(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

// ============================================================================
// Element tree
// ============================================================================

#[derive(Debug)]
enum Node {
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        children: Vec<Node>,
    },
    Text(String),
}

const VOID_ELEMENTS: &[&str] = &["br", "hr", "img", "input", "meta", "link", "wbr", "col"];

/// Elements nested deeper than this are flattened into their ancestor at
/// the cap: their tags are dropped, their content is kept.
pub const MAX_NESTING: usize = 64;

fn build_tree(tokens: Vec<Token>) -> Result<Vec<Node>> {
    let mut stack: Vec<(String, Vec<(String, String)>, Vec<Node>)> = Vec::new();
    let mut root: Vec<Node> = Vec::new();
    // Open elements past MAX_NESTING, innermost last
    let mut flattened: Vec<String> = Vec::new();

    for token in tokens {
        match token {
            Token::Text(text) => {
                let siblings = stack.last_mut().map(|(_, _, c)| c).unwrap_or(&mut root);
                siblings.push(Node::Text(text));
            }
            Token::Open {
                name,
                attrs,
                self_closing,
            } => {
                if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                    let siblings = stack.last_mut().map(|(_, _, c)| c).unwrap_or(&mut root);
                    siblings.push(Node::Element {
                        name,
                        attrs,
                        children: Vec::new(),
                    });
                } else if stack.len() >= MAX_NESTING {
                    if flattened.is_empty() {
                        warn!("Markup nested deeper than {} elements, flattening <{}>", MAX_NESTING, name);
                    }
                    flattened.push(name);
                } else {
                    stack.push((name, attrs, Vec::new()));
                }
            }
            Token::Close(name) => {
                if VOID_ELEMENTS.contains(&name.as_str()) {
                    continue;
                }
                if let Some(open) = flattened.pop() {
                    if open != name {
                        return Err(MarkupError::MismatchedTag {
                            expected: open,
                            found: name,
                        });
                    }
                    continue;
                }
                let (open, attrs, children) =
                    stack.pop().ok_or_else(|| MarkupError::UnexpectedClose(name.clone()))?;
                if open != name {
                    return Err(MarkupError::MismatchedTag {
                        expected: open,
                        found: name,
                    });
                }
                let siblings = stack.last_mut().map(|(_, _, c)| c).unwrap_or(&mut root);
                siblings.push(Node::Element {
                    name: open,
                    attrs,
                    children,
                });
            }
        }
    }

    if let Some(name) = flattened.pop().or_else(|| stack.pop().map(|(name, _, _)| name)) {
        return Err(MarkupError::Unclosed(name));
    }
    Ok(root)
}

// ============================================================================
// Element tree -> blocks
// ============================================================================

const INLINE_ELEMENTS: &[&str] = &[
    "strong", "b", "em", "i", "u", "s", "del", "strike", "code", "span", "a", "br", "sub", "sup",
    "mark", "small", "font", "label", "abbr",
];

/// Whitespace-only text containing a newline is source formatting, not content.
fn is_formatting(text: &str) -> bool {
    text.trim().is_empty() && text.contains('\n')
}

fn collect_blocks(nodes: &[Node], out: &mut Vec<BlockContent>) {
    let mut pending: Vec<TextRun> = Vec::new();

    for node in nodes {
        match node {
            Node::Text(text) => {
                if !is_formatting(text) {
                    inline_runs(node, &BTreeSet::new(), &mut pending);
                }
            }
            Node::Element { name, .. } if INLINE_ELEMENTS.contains(&name.as_str()) => {
                inline_runs(node, &BTreeSet::new(), &mut pending);
            }
            Node::Element {
                name,
                attrs,
                children,
            } => {
                flush_pending(&mut pending, out);
                block_element(name, attrs, children, out);
            }
        }
    }
    flush_pending(&mut pending, out);
}

fn flush_pending(pending: &mut Vec<TextRun>, out: &mut Vec<BlockContent>) {
    if pending.is_empty() {
        return;
    }
    let runs = std::mem::take(pending);
    if !runs_text(&runs).trim().is_empty() {
        out.push(BlockContent::new(BlockKind::Paragraph, runs));
    }
}

fn block_element(
    name: &str,
    attrs: &[(String, String)],
    children: &[Node],
    out: &mut Vec<BlockContent>,
) {
    match name {
        "p" => out.push(BlockContent::new(BlockKind::Paragraph, runs_of(children))),
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<u8>().unwrap_or(1).min(3);
            out.push(BlockContent::new(BlockKind::Heading { level }, runs_of(children)));
        }
        "blockquote" => out.push(BlockContent::new(BlockKind::Quote, runs_of(children))),
        "pre" => {
            let mut text = String::new();
            text_content(children, &mut text);
            out.push(BlockContent::new(BlockKind::Code, vec![TextRun::plain(text)]));
        }
        "ul" | "ol" => list_items(name == "ol", children, out),
        "li" => out.push(list_item(false, attrs, children)),
        "hr" | "img" => {}
        // Unknown container: keep its content
        _ => collect_blocks(children, out),
    }
}

fn list_items(ordered: bool, children: &[Node], out: &mut Vec<BlockContent>) {
    for child in children {
        match child {
            Node::Element {
                name,
                attrs,
                children,
            } if name == "li" => out.push(list_item(ordered, attrs, children)),
            Node::Element { .. } => collect_blocks(std::slice::from_ref(child), out),
            Node::Text(text) if !text.trim().is_empty() => {
                out.push(BlockContent::new(
                    BlockKind::Paragraph,
                    vec![TextRun::plain(text.clone())],
                ));
            }
            Node::Text(_) => {}
        }
    }
}

fn list_item(ordered: bool, attrs: &[(String, String)], children: &[Node]) -> BlockContent {
    let checked = attrs
        .iter()
        .find(|(k, _)| k == "data-checked")
        .map(|(_, v)| v == "true");
    let kind = match checked {
        Some(checked) => BlockKind::CheckItem { checked },
        None if ordered => BlockKind::NumberedItem,
        None => BlockKind::BulletItem,
    };

    let mut item = BlockContent::new(kind, Vec::new());
    for child in children {
        match child {
            Node::Element { name, children, .. } if name == "ul" || name == "ol" => {
                list_items(name == "ol", children, &mut item.children);
            }
            Node::Element { name, children, .. } if name == "p" => {
                for grandchild in children {
                    inline_runs(grandchild, &BTreeSet::new(), &mut item.runs);
                }
            }
            Node::Text(text) if is_formatting(text) => {}
            _ => inline_runs(child, &BTreeSet::new(), &mut item.runs),
        }
    }
    item
}

fn runs_of(children: &[Node]) -> Vec<TextRun> {
    let mut runs = Vec::new();
    for child in children {
        inline_runs(child, &BTreeSet::new(), &mut runs);
    }
    runs
}

fn inline_runs(node: &Node, styles: &BTreeSet<InlineStyle>, runs: &mut Vec<TextRun>) {
    match node {
        Node::Text(text) => push_run(
            runs,
            TextRun {
                text: text.clone(),
                styles: styles.clone(),
            },
        ),
        Node::Element { name, children, .. } => {
            if name == "br" {
                push_run(
                    runs,
                    TextRun {
                        text: "\n".to_string(),
                        styles: styles.clone(),
                    },
                );
                return;
            }

            let added = match name.as_str() {
                "strong" | "b" => Some(InlineStyle::Bold),
                "em" | "i" => Some(InlineStyle::Italic),
                "u" => Some(InlineStyle::Underline),
                "s" | "del" | "strike" => Some(InlineStyle::Strike),
                "code" => Some(InlineStyle::Code),
                _ => None,
            };
            let mut inner = styles.clone();
            if let Some(style) = added {
                inner.insert(style);
            }
            for child in children {
                inline_runs(child, &inner, runs);
            }
        }
    }
}

fn text_content(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Element { name, .. } if name == "br" => out.push('\n'),
            Node::Element { children, .. } => text_content(children, out),
        }
    }
}

// ============================================================================
// Blocks -> markup
// ============================================================================

fn list_tag(kind: &BlockKind) -> Option<&'static str> {
    match kind {
        BlockKind::BulletItem | BlockKind::CheckItem { .. } => Some("ul"),
        BlockKind::NumberedItem => Some("ol"),
        _ => None,
    }
}

fn write_blocks(blocks: &[BlockContent], out: &mut String) {
    let mut i = 0;
    while i < blocks.len() {
        let block = &blocks[i];
        let Some(tag) = list_tag(&block.kind) else {
            write_block(block, out);
            i += 1;
            continue;
        };

        // Group consecutive items of the same list type
        out.push('<');
        out.push_str(tag);
        out.push('>');
        while i < blocks.len() && list_tag(&blocks[i].kind) == Some(tag) {
            write_list_item(&blocks[i], out);
            i += 1;
        }
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
}

fn write_list_item(block: &BlockContent, out: &mut String) {
    match block.kind {
        BlockKind::CheckItem { checked } => {
            out.push_str(if checked {
                "<li data-checked=\"true\">"
            } else {
                "<li data-checked=\"false\">"
            });
        }
        _ => out.push_str("<li>"),
    }
    write_runs(&block.runs, out);
    write_blocks(&block.children, out);
    out.push_str("</li>");
}

fn write_block(block: &BlockContent, out: &mut String) {
    let tag = match block.kind {
        BlockKind::Paragraph => "p",
        BlockKind::Heading { level: 1 } => "h1",
        BlockKind::Heading { level: 2 } => "h2",
        BlockKind::Heading { .. } => "h3",
        BlockKind::Quote => "blockquote",
        BlockKind::Code => {
            out.push_str("<pre><code>");
            escape(&block.text(), out);
            out.push_str("</code></pre>");
            write_blocks(&block.children, out);
            return;
        }
        // List items are handled by write_blocks
        BlockKind::BulletItem | BlockKind::NumberedItem | BlockKind::CheckItem { .. } => "li",
    };

    out.push('<');
    out.push_str(tag);
    out.push('>');
    write_runs(&block.runs, out);
    out.push_str("</");
    out.push_str(tag);
    out.push('>');

    // Only list items nest in markup; other children are flattened after their parent
    write_blocks(&block.children, out);
}

fn style_tag(style: InlineStyle) -> &'static str {
    match style {
        InlineStyle::Bold => "strong",
        InlineStyle::Italic => "em",
        InlineStyle::Underline => "u",
        InlineStyle::Strike => "s",
        InlineStyle::Code => "code",
    }
}

fn write_runs(runs: &[TextRun], out: &mut String) {
    for run in runs {
        for style in &run.styles {
            out.push('<');
            out.push_str(style_tag(*style));
            out.push('>');
        }
        let mut lines = run.text.split('\n');
        if let Some(first) = lines.next() {
            escape(first, out);
        }
        for line in lines {
            out.push_str("<br>");
            escape(line, out);
        }
        for style in run.styles.iter().rev() {
            out.push_str("</");
            out.push_str(style_tag(*style));
            out.push('>');
        }
    }
}
