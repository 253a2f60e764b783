// 🌳 XML Tree - a small element tree over quick-xml
//
// Filing documents come in several vintages with different namespace
// prefixes and casing, so lookups here match on local names, ignoring case.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum XmlError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: usize, message: String },

    #[error("XML ended with {open} unclosed element(s)")]
    Unclosed { open: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    /// Local name (namespace prefix stripped)
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn named(name: &str) -> Self {
        XmlNode {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Direct child by local name
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.is(name))
    }

    /// First descendant (depth-first) by local name
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        for child in &self.children {
            if child.is(name) {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with this local name. Matched nodes are not searched further.
    pub fn find_all(&self, name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlNode>) {
        for child in &self.children {
            if child.is(name) {
                out.push(child);
            } else {
                child.collect(name, out);
            }
        }
    }

    /// Trimmed text of the first matching descendant, if non-empty
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.find(name)
            .map(|n| n.text.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a whole document. The returned node is a synthetic `#document`
/// root whose children are the top-level elements.
pub fn parse_document(input: &str) -> Result<XmlNode, XmlError> {
    let mut reader = Reader::from_str(input);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = vec![XmlNode::named("#document")];

    loop {
        let position = reader.buffer_position();
        let event = reader.read_event().map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(start) => stack.push(open_node(&start, position)?),
            Event::Empty(start) => {
                let node = open_node(&start, position)?;
                attach(&mut stack, node);
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err(XmlError::Malformed {
                        position,
                        message: "closing tag without matching opening tag".to_string(),
                    });
                }
                if let Some(node) = stack.pop() {
                    attach(&mut stack, node);
                }
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(|e| XmlError::Malformed {
                    position,
                    message: e.to_string(),
                })?;
                append_text(&mut stack, &value);
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                append_text(&mut stack, &value);
            }
            Event::Eof => break,
            // declarations, comments, processing instructions, doctype
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(XmlError::Unclosed {
            open: stack.len() - 1,
        });
    }

    stack.pop().ok_or(XmlError::Unclosed { open: 0 })
}

fn open_node(start: &BytesStart<'_>, position: usize) -> Result<XmlNode, XmlError> {
    let mut node = XmlNode::named(&String::from_utf8_lossy(start.local_name().as_ref()));

    for attr in start.attributes().with_checks(false) {
        let attr = attr.map_err(|e| XmlError::Malformed {
            position,
            message: e.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Malformed {
                position,
                message: e.to_string(),
            })?
            .into_owned();
        node.attributes.push((key, value));
    }

    Ok(node)
}

fn attach(stack: &mut [XmlNode], node: XmlNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn append_text(stack: &mut [XmlNode], value: &str) {
    if let Some(current) = stack.last_mut() {
        if !current.text.is_empty() {
            current.text.push(' ');
        }
        current.text.push_str(value);
    }
}
