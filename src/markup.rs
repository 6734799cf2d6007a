//! Structured document reader: parses nested fiscal XML (goods invoices and
//! service notes) into raw field trees. A single file may wrap one or many
//! records; every record element found becomes one tree, never just the
//! first.

use std::collections::BTreeMap;

use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{FiscalAuditError, Result};
use crate::schema::DocumentKind;
use crate::tabular::decode_text;

/// One parsed element: namespace-stripped name, attributes, direct text and
/// child elements in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn new(name: String) -> Self {
        XmlNode {
            name,
            attributes: BTreeMap::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Walks a child path from this node.
    pub fn at(&self, path: &[&str]) -> Option<&XmlNode> {
        let mut node = self;
        for name in path {
            node = node.child(name)?;
        }
        Some(node)
    }

    /// Trimmed text at a child path; None when absent or empty.
    pub fn text_at(&self, path: &[&str]) -> Option<String> {
        let text = self.at(path)?.text.trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|v| v.as_str())
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &str) -> Vec<&'a XmlNode> {
        self.children.iter().filter(|c| c.name == name).collect()
    }

    /// All descendants (including self) with the given name, depth-first.
    pub fn descendants_named<'a>(&'a self, name: &str) -> Vec<&'a XmlNode> {
        let mut found = Vec::new();
        self.collect_named(name, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlNode>) {
        if self.name == name {
            found.push(self);
        }
        for child in &self.children {
            child.collect_named(name, found);
        }
    }
}

/// Reads a markup file and enumerates every fiscal record in it. Returns the
/// detected document kind and one field tree per record element found.
pub fn read_records(source_name: &str, bytes: &[u8]) -> Result<(DocumentKind, Vec<XmlNode>)> {
    let (text, encoding) = decode_text(source_name, bytes)?;
    let root = parse_tree(source_name, &text)?;

    let service_notes = root.descendants_named("InfNfse");
    let invoices = root.descendants_named("infNFe");
    debug!(
        "{}: decoded as {}, {} service-note and {} invoice record elements",
        source_name,
        encoding,
        service_notes.len(),
        invoices.len()
    );

    let (kind, records) = if !service_notes.is_empty() && service_notes.len() >= invoices.len() {
        (DocumentKind::ServiceNote, service_notes)
    } else if !invoices.is_empty() {
        (DocumentKind::Invoice, invoices)
    } else {
        return Err(FiscalAuditError::MalformedDocument {
            source_name: source_name.to_string(),
            details: "no recognizable fiscal record element (infNFe or InfNfse)".to_string(),
        });
    };

    Ok((kind, records.into_iter().cloned().collect()))
}

/// Parses the whole document into a tree under a synthetic root, so files
/// with leading processing instructions or sibling top-level junk still
/// yield their elements.
fn parse_tree(source_name: &str, text: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<XmlNode> = vec![XmlNode::new(String::new())];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(element_node(source_name, &e)?);
            }
            Ok(Event::Empty(e)) => {
                let node = element_node(source_name, &e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::End(_)) => {
                let node = match stack.pop() {
                    Some(node) if !stack.is_empty() => node,
                    _ => return Err(malformed(source_name, "unbalanced closing tag")),
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| malformed(source_name, &format!("bad text content: {}", e)))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(unescaped.trim());
                }
            }
            Ok(Event::CData(t)) => {
                let raw = t.into_inner();
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(String::from_utf8_lossy(&raw).trim());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(malformed(source_name, &format!("XML parse error: {}", e)));
            }
        }
    }

    if stack.len() != 1 {
        return Err(malformed(source_name, "unclosed element at end of input"));
    }
    Ok(stack.remove(0))
}

fn element_node(
    source_name: &str,
    element: &quick_xml::events::BytesStart<'_>,
) -> Result<XmlNode> {
    let name = String::from_utf8_lossy(element.name().local_name().as_ref()).into_owned();
    let mut node = XmlNode::new(name);
    for attribute in element.attributes() {
        let attribute =
            attribute.map_err(|e| malformed(source_name, &format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| malformed(source_name, &format!("bad attribute value: {}", e)))?
            .into_owned();
        node.attributes.insert(key, value);
    }
    Ok(node)
}

fn malformed(source_name: &str, details: &str) -> FiscalAuditError {
    FiscalAuditError::MalformedDocument {
        source_name: source_name.to_string(),
        details: details.to_string(),
    }
}
