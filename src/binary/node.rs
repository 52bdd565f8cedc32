//! The stanza element shape shared by every component.
//!
//! A node is a tag, a set of string attributes, and a payload that is
//! either raw bytes (ciphertexts, key material) or nested elements.
//! The relay only builds and walks nodes; the transport owns the wire
//! encoding. Accessors for mandatory attributes and children return
//! [`crate::Error::ElementMissing`] so response parsers can lean on `?`
//! instead of hand-rolling each absence check.

use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub content: NodeContent,
}

/// Node payload; stanzas carry bytes or child elements, never both
#[derive(Debug, Clone, PartialEq)]
pub enum NodeContent {
    None,
    Binary(Vec<u8>),
    Children(Vec<Node>),
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: HashMap::new(),
            content: NodeContent::None,
        }
    }

    /// Add or replace an attribute, builder style
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Replace the payload with child elements
    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Replace the payload with binary data
    pub fn with_binary(mut self, data: Vec<u8>) -> Self {
        self.content = NodeContent::Binary(data);
        self
    }

    /// Attribute value, if present
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Value of a mandatory attribute
    pub fn attr_or_missing(&self, key: &str) -> Result<&str> {
        self.get_attr(key).ok_or_else(|| {
            Error::ElementMissing(format!("{} attribute on <{}>", key, self.tag))
        })
    }

    /// Child elements; empty for binary or childless nodes
    pub fn children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    /// Binary payload, if any
    pub fn binary(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// First child with the given tag
    pub fn find_child(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|child| child.tag == tag)
    }

    /// All children with the given tag
    pub fn find_children(&self, tag: &str) -> Vec<&Node> {
        self.children()
            .iter()
            .filter(|child| child.tag == tag)
            .collect()
    }

    /// First child with the given tag, erroring when absent; response
    /// parsers use this for mandatory children
    pub fn expect_child(&self, tag: &str) -> Result<&Node> {
        self.find_child(tag)
            .ok_or_else(|| Error::ElementMissing(format!("<{}> in <{}>", tag, self.tag)))
    }

    /// Binary payload of a mandatory child
    pub fn binary_child(&self, tag: &str) -> Result<&[u8]> {
        self.expect_child(tag)?
            .binary()
            .ok_or_else(|| Error::ElementMissing(format!("binary content of <{}>", tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_and_accessors() {
        let node = Node::new("message")
            .attr("id", "abc")
            .with_children(vec![Node::new("enc").with_binary(vec![1, 2, 3])]);

        assert_eq!(node.get_attr("id"), Some("abc"));
        assert_eq!(node.attr_or_missing("id").unwrap(), "abc");
        assert_eq!(node.children().len(), 1);
        assert_eq!(node.binary(), None);
        assert_eq!(node.binary_child("enc").unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_find_children() {
        let node = Node::new("list").with_children(vec![
            Node::new("item").attr("id", "1"),
            Node::new("item").attr("id", "2"),
            Node::new("other"),
        ]);
        assert_eq!(node.find_children("item").len(), 2);
        assert!(node.find_children("missing").is_empty());
        assert_eq!(node.find_child("item").unwrap().get_attr("id"), Some("1"));
    }

    #[test]
    fn test_missing_pieces_are_errors() {
        let node = Node::new("iq");
        assert!(matches!(
            node.expect_child("media_conn").unwrap_err(),
            Error::ElementMissing(_)
        ));
        assert!(matches!(
            node.attr_or_missing("id").unwrap_err(),
            Error::ElementMissing(_)
        ));
        // A child without binary content is as missing as no child.
        let wrapper = Node::new("encrypt").with_children(vec![Node::new("enc_p")]);
        assert!(wrapper.binary_child("enc_p").is_err());
    }

    #[test]
    fn test_children_of_binary_node_are_empty() {
        let node = Node::new("enc").with_binary(vec![9]);
        assert!(node.children().is_empty());
        assert!(node.find_child("anything").is_none());
        assert_eq!(node.binary(), Some(&[9u8][..]));
    }
}
