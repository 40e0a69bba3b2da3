//! KDL value extraction helpers.
//!
//! Getters look up a named child node and read its first argument. A missing
//! node yields `None`; a node whose argument has the wrong type is an error,
//! so typos in values never silently fall back to defaults.

use anyhow::{anyhow, Result};

fn first_value<'a>(node: &'a kdl::KdlNode, name: &str) -> Option<&'a kdl::KdlValue> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .map(|e| e.value())
}

fn type_error(parent: &kdl::KdlNode, name: &str, expected: &str) -> anyhow::Error {
    anyhow!(
        "'{}.{}' must be {}",
        parent.name().value(),
        name,
        expected
    )
}

/// Get a string entry from a KDL node
pub fn get_string_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<String>> {
    match first_value(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| type_error(node, name, "a string")),
    }
}

/// Get a non-negative integer entry from a KDL node
pub fn get_u64_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<u64>> {
    match first_value(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| type_error(node, name, "a non-negative integer")),
    }
}

/// Get a signed integer entry from a KDL node
pub fn get_i64_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<i64>> {
    match first_value(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| i64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| type_error(node, name, "an integer")),
    }
}

/// Get a boolean entry from a KDL node
pub fn get_bool_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<bool>> {
    match first_value(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| type_error(node, name, "#true or #false")),
    }
}

/// Get every positional string argument of a named child node
pub fn get_string_args(node: &kdl::KdlNode, name: &str) -> Result<Option<Vec<String>>> {
    let Some(child) = node.children().and_then(|children| children.get(name)) else {
        return Ok(None);
    };

    child
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| {
            e.value()
                .as_string()
                .map(|s| s.to_string())
                .ok_or_else(|| type_error(node, name, "a list of strings"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Get a named child block
pub fn get_block<'a>(node: &'a kdl::KdlNode, name: &str) -> Option<&'a kdl::KdlNode> {
    node.children().and_then(|children| children.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(src: &str) -> kdl::KdlNode {
        let doc: kdl::KdlDocument = src.parse().unwrap();
        doc.nodes()[0].clone()
    }

    #[test]
    fn test_missing_entry_is_none() {
        let n = node("acme { staging #true }");
        assert_eq!(get_u64_entry(&n, "issuance-timeout-secs").unwrap(), None);
        assert_eq!(get_bool_entry(&n, "staging").unwrap(), Some(true));
    }

    #[test]
    fn test_wrong_type_is_error() {
        let n = node(r#"acme { issuance-timeout-secs "ten" }"#);
        let err = get_u64_entry(&n, "issuance-timeout-secs").unwrap_err();
        assert!(err.to_string().contains("acme.issuance-timeout-secs"));
    }

    #[test]
    fn test_negative_is_not_u64() {
        let n = node("validation { port -1 }");
        assert!(get_u64_entry(&n, "port").is_err());
        assert_eq!(get_i64_entry(&n, "port").unwrap(), Some(-1));
    }

    #[test]
    fn test_string_args() {
        let n = node(r#"dns { nameservers "8.8.8.8" "1.1.1.1" }"#);
        assert_eq!(
            get_string_args(&n, "nameservers").unwrap(),
            Some(vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()])
        );
    }
}
