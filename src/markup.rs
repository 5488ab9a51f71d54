//! Owned markup tree for the XML and XHTML documents inside an EPUB.
//!
//! Parsing is SAX-style with `quick_xml`, folding events into a tree where
//! every element owns its children. There are no parent pointers: all
//! rewrites (drop an element, replace it with its text, annotate it) walk the
//! tree top-down over `&mut Vec<Node>`.
//!
//! The parser is forgiving in the ways real EPUB content needs: an end tag
//! closes back to the nearest open element with that name, stray end tags are
//! ignored, anything still open at end of input is closed, and unknown
//! entities are kept as written.

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Local name, without any namespace prefix. Empty for the document root.
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                for child in &element.children {
                    child.collect_text(out);
                }
            }
        }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        }
    }
}

impl Element {
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Concatenated text of every descendant text node, untrimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            child.collect_text(&mut out);
        }
        out
    }

    /// First descendant element named `name`, in document order.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(element) = child {
                if element.is(name) {
                    return Some(element);
                }
                if let Some(found) = element.find(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Every descendant element named `name`, in document order.
    pub fn find_all(&self, name: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        self.collect_named(name, &mut out);
        out
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if let Node::Element(element) = child {
                if element.is(name) {
                    out.push(element);
                }
                element.collect_named(name, out);
            }
        }
    }

    /// Element children only, skipping text nodes.
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    /// Detach the first descendant named `name` and return it.
    pub fn take(&mut self, name: &str) -> Option<Element> {
        for idx in 0..self.children.len() {
            let matched = matches!(&self.children[idx], Node::Element(el) if el.is(name));
            if matched {
                if let Node::Element(found) = self.children.remove(idx) {
                    return Some(found);
                }
            }
            if let Node::Element(child) = &mut self.children[idx] {
                if let Some(found) = child.take(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Remove every descendant named `name` together with its contents.
    pub fn remove_all(&mut self, name: &str) {
        remove_all(&mut self.children, name);
    }

    /// Replace every descendant named `name` with a text node of its content.
    pub fn replace_with_text(&mut self, name: &str) {
        replace_with_text(&mut self.children, name);
    }

    /// Visit every descendant named `name`, outermost first.
    pub fn for_each_mut<F>(&mut self, name: &str, f: &mut F)
    where
        F: FnMut(&mut Element),
    {
        for child in &mut self.children {
            if let Node::Element(element) = child {
                if element.is(name) {
                    f(element);
                }
                element.for_each_mut(name, f);
            }
        }
    }

    pub fn prepend_text(&mut self, text: &str) {
        self.children.insert(0, Node::Text(text.to_string()));
    }

    pub fn append_text(&mut self, text: &str) {
        self.children.push(Node::Text(text.to_string()));
    }
}

fn remove_all(children: &mut Vec<Node>, name: &str) {
    children.retain(|child| !matches!(child, Node::Element(el) if el.is(name)));
    for child in children.iter_mut() {
        if let Node::Element(element) = child {
            remove_all(&mut element.children, name);
        }
    }
}

fn replace_with_text(children: &mut [Node], name: &str) {
    for child in children.iter_mut() {
        let replacement = match child {
            Node::Element(element) if element.is(name) => Some(element.text()),
            Node::Element(element) => {
                replace_with_text(&mut element.children, name);
                None
            }
            Node::Text(_) => None,
        };
        if let Some(text) = replacement {
            *child = Node::Text(text);
        }
    }
}

/// Parse a document into a tree under a nameless root element.
pub fn parse(source: &str) -> Result<Element, String> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Element> = vec![Element::default()];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let element = open_element(&e, &reader)?;
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = open_element(&e, &reader)?;
                push_node(&mut stack, Node::Element(element));
            }
            Ok(Event::End(e)) => {
                let name = decode_name(e.local_name().as_ref(), &reader)?;
                close_element(&mut stack, &name);
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .decode()
                    .map_err(|err| format!("Decode error: {err:?}"))?;
                push_text(&mut stack, &text);
            }
            Ok(Event::CData(e)) => {
                let text = reader
                    .decoder()
                    .decode(&e)
                    .map_err(|err| format!("Decode error: {err:?}"))?;
                push_text(&mut stack, &text);
            }
            Ok(Event::GeneralRef(e)) => {
                let entity = e
                    .decode()
                    .map_err(|err| format!("Decode error: {err:?}"))?;
                push_text(&mut stack, &resolve_entity(&entity));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(format!(
                    "XML error at byte {}: {err}",
                    reader.buffer_position()
                ));
            }
        }
    }

    while stack.len() > 1 {
        fold_top(&mut stack);
    }
    Ok(stack.pop().unwrap_or_default())
}

fn open_element(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Element, String> {
    let name = decode_name(e.local_name().as_ref(), reader)?;
    let mut attrs = Vec::new();
    for attr in e.attributes().flatten() {
        let key = decode_name(attr.key.local_name().as_ref(), reader)?;
        let raw = reader
            .decoder()
            .decode(&attr.value)
            .map_err(|err| format!("Decode error: {err:?}"))?;
        let value = match unescape(&raw) {
            Ok(value) => value.into_owned(),
            Err(_) => raw.into_owned(),
        };
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn decode_name(name: &[u8], reader: &Reader<&[u8]>) -> Result<String, String> {
    reader
        .decoder()
        .decode(name)
        .map(|s| s.to_string())
        .map_err(|err| format!("Decode error: {err:?}"))
}

/// Predefined and numeric references decode normally. `nbsp` is the one HTML
/// entity common enough in EPUB content to special-case; anything else is
/// kept literally.
fn resolve_entity(name: &str) -> String {
    let reference = format!("&{name};");
    match unescape(&reference) {
        Ok(resolved) => resolved.into_owned(),
        Err(_) if name == "nbsp" => "\u{a0}".to_string(),
        Err(_) => reference,
    }
}

fn push_node(stack: &mut [Element], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn push_text(stack: &mut [Element], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(parent) = stack.last_mut() {
        if let Some(Node::Text(last)) = parent.children.last_mut() {
            last.push_str(text);
        } else {
            parent.children.push(Node::Text(text.to_string()));
        }
    }
}

fn fold_top(stack: &mut Vec<Element>) {
    if let Some(done) = stack.pop() {
        push_node(stack, Node::Element(done));
    }
}

fn close_element(stack: &mut Vec<Element>, name: &str) {
    // Index 0 is the document root and never matches an end tag.
    let Some(open_at) = stack
        .iter()
        .skip(1)
        .rposition(|element| element.name.eq_ignore_ascii_case(name))
        .map(|pos| pos + 1)
    else {
        return;
    };
    while stack.len() > open_at {
        fold_top(stack);
    }
}
