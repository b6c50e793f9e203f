//! YAML helpers built on serde_yaml
//!
//! Rendering typed values into YAML blocks that are spliced into larger
//! documents at a given indentation.

use serde::Serialize;

use crate::Error;

/// Serialize a value to YAML.
///
/// The result always ends with a newline. `kind` names the value in the
/// error when serialization fails.
pub fn to_yaml<T: Serialize>(kind: &str, value: &T) -> Result<String, Error> {
    serde_yaml::to_string(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Indent every non-empty line of `text` by `spaces` spaces.
///
/// Empty lines stay empty so the result never carries trailing whitespace.
pub fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    let mut out = String::with_capacity(text.len() + spaces * text.lines().count());
    for line in text.split_inclusive('\n') {
        if !line.trim().is_empty() {
            out.push_str(&pad);
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_to_yaml_ends_with_newline() {
        let mut map = BTreeMap::new();
        map.insert("cpu", "100m");
        let yaml = to_yaml("resources", &map).unwrap();
        assert_eq!(yaml, "cpu: 100m\n");
    }

    #[test]
    fn test_indent_skips_blank_lines() {
        let text = "a: 1\n\nb:\n  c: 2\n";
        assert_eq!(indent(text, 2), "  a: 1\n\n  b:\n    c: 2\n");
    }

    #[test]
    fn test_indent_without_trailing_newline() {
        assert_eq!(indent("a\nb", 4), "    a\n    b");
        assert_eq!(indent("", 4), "");
    }
}
