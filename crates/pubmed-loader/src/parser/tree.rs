//! Generic XML element tree
//!
//! A citation element is converted into a recursive node structure during
//! parsing and serialized to JSON only at the storage boundary. Children are
//! kept in document order; repeated tags are collapsed into arrays on
//! serialization.

use serde_json::{Map, Value};

/// One XML element: its text, attributes, and ordered children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    /// Concatenated, trimmed text content (None when empty)
    pub text: Option<String>,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Child elements in document order; a tag may repeat
    pub children: Vec<(String, XmlNode)>,
}

impl XmlNode {
    /// First child with the given tag
    pub fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, node)| node)
    }

    /// All children with the given tag, in document order
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children
            .iter()
            .filter(move |(name, _)| name == tag)
            .map(|(_, node)| node)
    }

    /// Descend a slash-separated path of first-matching children
    pub fn at(&self, path: &str) -> Option<&XmlNode> {
        path.split('/').try_fold(self, |node, tag| node.child(tag))
    }

    /// Text content of the node at a slash-separated path
    pub fn text_at(&self, path: &str) -> Option<&str> {
        self.at(path).and_then(|node| node.text.as_deref())
    }

    /// Attribute value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Append a trimmed text fragment, ignoring whitespace-only content
    pub fn push_text(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        match &mut self.text {
            Some(existing) => existing.push_str(fragment),
            None => self.text = Some(fragment.to_string()),
        }
    }

    /// Serialize to a JSON object
    ///
    /// Text lands under `"#text"`, attributes under `"@name"`, and children
    /// under their tag; a repeated tag becomes an array in document order.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();

        if let Some(text) = &self.text {
            map.insert("#text".to_string(), Value::String(text.clone()));
        }

        for (key, value) in &self.attributes {
            map.insert(format!("@{}", key), Value::String(value.clone()));
        }

        for (tag, child) in &self.children {
            let child_json = child.to_json();
            match map.get_mut(tag.as_str()) {
                None => {
                    map.insert(tag.clone(), child_json);
                },
                Some(Value::Array(items)) => {
                    items.push(child_json);
                },
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, child_json]);
                },
            }
        }

        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(text: &str) -> XmlNode {
        XmlNode {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_to_json_text_and_attributes() {
        let node = XmlNode {
            text: Some("12345".to_string()),
            attributes: vec![("Version".to_string(), "1".to_string())],
            children: Vec::new(),
        };
        assert_eq!(node.to_json(), json!({"#text": "12345", "@Version": "1"}));
    }

    #[test]
    fn test_to_json_repeated_children_collapse_to_array() {
        let node = XmlNode {
            text: None,
            attributes: Vec::new(),
            children: vec![
                ("PMID".to_string(), leaf("1")),
                ("PMID".to_string(), leaf("2")),
                ("PMID".to_string(), leaf("3")),
            ],
        };
        assert_eq!(
            node.to_json(),
            json!({"PMID": [{"#text": "1"}, {"#text": "2"}, {"#text": "3"}]})
        );
    }

    #[test]
    fn test_path_navigation() {
        let inner = XmlNode {
            text: None,
            attributes: Vec::new(),
            children: vec![("ISSN".to_string(), leaf("1234-5678"))],
        };
        let node = XmlNode {
            text: None,
            attributes: Vec::new(),
            children: vec![("Journal".to_string(), inner)],
        };

        assert_eq!(node.text_at("Journal/ISSN"), Some("1234-5678"));
        assert!(node.at("Journal/Title").is_none());
        assert!(node.text_at("Missing/ISSN").is_none());
    }

    #[test]
    fn test_push_text_skips_whitespace() {
        let mut node = XmlNode::default();
        node.push_text("   \n  ");
        assert!(node.text.is_none());
        node.push_text("  hello ");
        node.push_text(" world ");
        assert_eq!(node.text.as_deref(), Some("helloworld"));
    }
}
