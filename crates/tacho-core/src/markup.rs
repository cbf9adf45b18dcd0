//! Structured comment fences embedded in record bodies.
//!
//! The record body is rendered markup meant for humans. Machine-readable
//! structure rides along in HTML comments so it survives rendering untouched:
//!
//! ```text
//! FENCE  ::= OPEN | CLOSE | VOID
//! OPEN   ::= "<!-- tacho:" name attrs " -->"
//! CLOSE  ::= "<!-- /tacho:" name " -->"
//! VOID   ::= "<!-- tacho:" name attrs " /-->"
//! attrs  ::= (" " key "=\"" escaped "\"")*
//! ```
//!
//! Attribute values escape `&`, `"`, `<` and `>`, so a value can never end a
//! comment early. Text between fences is kept as [`Node::Text`].
//!
//! Parsing is lenient: unmatched close fences and malformed fences degrade to
//! text, and elements still open at the end of input are closed implicitly.
//! A corrupted record must never block future publishes.

use std::fmt::Write as _;

use crate::id::HolderId;

/// Prefix of every opening or void fence.
pub const OPEN_PREFIX: &str = "<!-- tacho:";

/// Prefix of every closing fence.
pub const CLOSE_PREFIX: &str = "<!-- /tacho:";

const COMMENT_START: &str = "<!-- ";
const COMMENT_END: &str = "-->";

/// Fence name of the lock marker.
pub const LOCK: &str = "lock";

/// A parsed fragment of a record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A fenced element.
    Element(Element),
    /// Raw text between fences.
    Text(String),
}

/// A fenced element with ordered attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Fence name (after `tacho:`).
    pub name: String,
    /// Attributes in source order.
    pub attrs: Vec<(String, String)>,
    /// Child nodes (always empty for void fences).
    pub children: Vec<Node>,
    /// Whether the fence was self-closing.
    pub void: bool,
}

impl Element {
    /// Returns the value of an attribute.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over child elements with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |node| match node {
            Node::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    /// Concatenates the text children of this element.
    #[must_use]
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }
}

/// Finds the first element with the given name, searching depth-first.
#[must_use]
pub fn find<'a>(nodes: &'a [Node], name: &str) -> Option<&'a Element> {
    nodes.iter().find_map(|node| match node {
        Node::Element(el) if el.name == name => Some(el),
        Node::Element(el) => find(&el.children, name),
        Node::Text(_) => None,
    })
}

/// Parses a body into fence nodes.
#[must_use]
pub fn parse(input: &str) -> Vec<Node> {
    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut pos = 0;

    for comment in comments(input) {
        push_text(current(&mut root, &mut stack), &input[pos..comment.start]);
        let raw = &input[comment.start..comment.end];

        match parse_fence(comment.inner) {
            Some(Fence::Open(el)) => stack.push(el),
            Some(Fence::Void(el)) => {
                current(&mut root, &mut stack).push(Node::Element(el));
            }
            Some(Fence::Close(name)) => {
                if stack.iter().any(|el| el.name == name) {
                    while let Some(el) = stack.pop() {
                        let done = el.name == name;
                        current(&mut root, &mut stack).push(Node::Element(el));
                        if done {
                            break;
                        }
                    }
                } else {
                    tracing::debug!(fence = %name, "ignoring unmatched close fence");
                    push_text(current(&mut root, &mut stack), raw);
                }
            }
            None => push_text(current(&mut root, &mut stack), raw),
        }
        pos = comment.end;
    }
    push_text(current(&mut root, &mut stack), &input[pos..]);

    while let Some(el) = stack.pop() {
        current(&mut root, &mut stack).push(Node::Element(el));
    }
    root
}

/// One complete HTML comment, located the way [`parse`] sees it.
struct Comment<'a> {
    start: usize,
    end: usize,
    /// Trimmed text between the delimiters.
    inner: &'a str,
}

fn comments(input: &str) -> impl Iterator<Item = Comment<'_>> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        let start = pos + input.get(pos..)?.find(COMMENT_START)?;
        let end_offset = input[start..].find(COMMENT_END)?;
        let end = start + end_offset + COMMENT_END.len();
        pos = end;
        Some(Comment {
            start,
            end,
            inner: input[start + COMMENT_START.len()..start + end_offset].trim(),
        })
    })
}

fn current<'a>(root: &'a mut Vec<Node>, stack: &'a mut [Element]) -> &'a mut Vec<Node> {
    match stack.last_mut() {
        Some(el) => &mut el.children,
        None => root,
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text(last)) = nodes.last_mut() {
        last.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

enum Fence {
    Open(Element),
    Void(Element),
    Close(String),
}

fn parse_fence(inner: &str) -> Option<Fence> {
    if let Some(name) = inner.strip_prefix("/tacho:") {
        let name = name.trim();
        return is_name(name).then(|| Fence::Close(name.to_string()));
    }

    let rest = inner.strip_prefix("tacho:")?;
    let (rest, void) = match rest.strip_suffix('/') {
        Some(r) => (r.trim_end(), true),
        None => (rest, false),
    };
    let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let name = &rest[..name_end];
    if !is_name(name) {
        return None;
    }
    let attrs = parse_attrs(&rest[name_end..])?;
    let el = Element {
        name: name.to_string(),
        attrs,
        children: Vec::new(),
        void,
    };
    Some(if void { Fence::Void(el) } else { Fence::Open(el) })
}

fn parse_attrs(mut rest: &str) -> Option<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Some(attrs);
        }
        let eq = rest.find("=\"")?;
        let key = &rest[..eq];
        if !is_name(key) {
            return None;
        }
        let value_start = eq + 2;
        let value_len = rest[value_start..].find('"')?;
        let value = &rest[value_start..value_start + value_len];
        attrs.push((key.to_string(), unescape_attr(value)));
        rest = &rest[value_start + value_len + 1..];
    }
}

fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Escapes an attribute value.
#[must_use]
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape_attr`].
#[must_use]
pub fn unescape_attr(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Renders an opening fence.
#[must_use]
pub fn open_fence(name: &str, attrs: &[(&str, &str)]) -> String {
    format!("{OPEN_PREFIX}{name}{} -->", render_attrs(attrs))
}

/// Renders a self-closing fence.
#[must_use]
pub fn void_fence(name: &str, attrs: &[(&str, &str)]) -> String {
    format!("{OPEN_PREFIX}{name}{} /-->", render_attrs(attrs))
}

/// Renders a closing fence.
#[must_use]
pub fn close_fence(name: &str) -> String {
    format!("{CLOSE_PREFIX}{name} -->")
}

fn render_attrs(attrs: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (key, value) in attrs {
        let _ = write!(out, " {key}=\"{}\"", escape_attr(value));
    }
    out
}

/// Returns true if the text contains anything that would parse as a fence.
///
/// Uses the parser's own comment scan, so whitespace variants such as
/// `<!--  /tacho:content -->` are caught too.
#[must_use]
pub fn contains_fence(text: &str) -> bool {
    comments(text).any(|c| parse_fence(c.inner).is_some())
}

/// Returns the holder recorded in the body's lock marker, if any.
#[must_use]
pub fn lock_holder(body: &str) -> Option<String> {
    parse(body).iter().find_map(|node| match node {
        Node::Element(el) if el.name == LOCK => el.attr("holder").map(str::to_string),
        _ => None,
    })
}

/// Returns true if the body's lock marker names the given holder.
#[must_use]
pub fn is_held_by(body: &str, holder: &HolderId) -> bool {
    lock_holder(body).is_some_and(|h| h == holder.to_string())
}

/// Returns the body with our lock marker on the first line.
///
/// Any existing lock marker is replaced; all other content is preserved.
#[must_use]
pub fn with_lock(body: &str, holder: &HolderId) -> String {
    let holder = holder.to_string();
    format!(
        "{}\n{}",
        void_fence(LOCK, &[("holder", &holder)]),
        without_lock(body)
    )
}

/// Returns the body with every lock marker removed.
#[must_use]
pub fn without_lock(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut pos = 0;
    for comment in comments(body) {
        let is_lock = matches!(
            parse_fence(comment.inner),
            Some(Fence::Void(el) | Fence::Open(el)) if el.name == LOCK
        );
        if !is_lock {
            continue;
        }
        out.push_str(&body[pos..comment.start]);
        pos = comment.end;
        if body[pos..].starts_with('\n') {
            pos += 1;
        }
    }
    out.push_str(&body[pos..]);
    out
}
