//! Minimal element tree over `quick-xml` events.
//!
//! Produces an [`XmlNode`] tree where attributes are merged onto their
//! element and children are always a list. A field that may repeat looks
//! the same whether it occurs once or many times, so callers never have to
//! distinguish "single object" from "array of one".
//!
//! Element names keep their namespace prefix (`lomimscc:title`); lookups
//! can match either the qualified name or the local name.

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

/// Errors raised while building an element tree.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("document has no root element")]
    NoRoot,
}

/// One XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct XmlNode {
    /// Qualified name as written, prefix included.
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Concatenated, trimmed character data directly inside this element.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        split_prefix(&self.name).1
    }

    /// Namespace prefix, if the name carried one.
    pub fn prefix(&self) -> Option<&str> {
        split_prefix(&self.name).0
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Trimmed text, `None` when absent or blank.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Children whose qualified name equals `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Children whose local name equals `local`, whatever their prefix.
    pub fn children_local<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.local_name() == local)
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_local(&self, local: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    /// Follows `path` (qualified names), taking the first match at each step.
    pub fn find_path(&self, path: &[&str]) -> Option<&XmlNode> {
        path.iter().try_fold(self, |node, step| node.child(step))
    }

    /// Depth-first, pre-order search for the first descendant matching `pred`.
    pub fn find_descendant(&self, pred: &dyn Fn(&XmlNode) -> bool) -> Option<&XmlNode> {
        for child in &self.children {
            if pred(child) {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(pred) {
                return Some(found);
            }
        }
        None
    }
}

fn split_prefix(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}

/// Parses `xml` into its root element.
pub fn parse_document(xml: &[u8]) -> Result<XmlNode, XmlError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| malformed(&reader, e))?;
        match event {
            Event::Start(e) => {
                stack.push(element(&reader, &e)?);
            }
            Event::Empty(e) => {
                let node = element(&reader, &e)?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    attach(&mut stack, &mut root, node);
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| malformed(&reader, e))?;
                push_text(&mut stack, &text);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                push_text(&mut stack, &String::from_utf8_lossy(&raw));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(XmlError::Malformed {
            position: reader.buffer_position() as u64,
            message: format!("unclosed element <{}>", stack[stack.len() - 1].name),
        });
    }
    root.ok_or(XmlError::NoRoot)
}

fn element(reader: &Reader<&[u8]>, start: &BytesStart<'_>) -> Result<XmlNode, XmlError> {
    let mut node = XmlNode::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(reader, e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| malformed(reader, e))?;
        node.attributes.insert(key, value.into_owned());
    }
    Ok(node)
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_none() {
                *root = Some(node);
            }
        }
    }
}

fn push_text(stack: &mut [XmlNode], text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if let Some(node) = stack.last_mut() {
        match node.text.as_mut() {
            Some(existing) => {
                existing.push(' ');
                existing.push_str(text);
            }
            None => node.text = Some(text.to_string()),
        }
    }
}

fn malformed(reader: &Reader<&[u8]>, err: impl std::fmt::Display) -> XmlError {
    XmlError::Malformed {
        position: reader.buffer_position() as u64,
        message: err.to_string(),
    }
}
