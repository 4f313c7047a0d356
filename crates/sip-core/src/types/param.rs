//! # SIP Parameters
//!
//! Ordered `;name[=value]` lists attached to URIs and header values
//! (`;transport=udp`, `;tag=1928301774`, `;lr`, `;branch=z9hG4bK...`).
//!
//! Names compare case-insensitively; insertion order is preserved so a
//! re-serialized header keeps the parameters where the peer put them.

use std::fmt;

/// Ordered list of `;name[=value]` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Params(Vec::new())
    }

    /// Parse the text following the first `;`, e.g. `tag=abc;lr`.
    ///
    /// Splits on `;` outside double quotes; empty segments are skipped.
    pub fn parse(input: &str) -> Self {
        let mut params = Params::new();
        for segment in split_outside_quotes(input, ';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => params
                    .0
                    .push((name.trim().to_string(), Some(value.trim().to_string()))),
                None => params.0.push((segment.to_string(), None)),
            }
        }
        params
    }

    /// Value of `name`; `Some(None)` for a flag parameter
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Value of `name`, ignoring flag parameters
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the value of `name` in place, or append it
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Split `input` on `sep`, ignoring separators inside double quotes or
/// angle brackets
pub(crate) fn split_outside_quotes(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            c if c == sep && !in_quotes && !in_angle => {
                parts.push(&input[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_keep_order() {
        let params = Params::parse("tag=abc;lr;Transport=UDP");
        assert_eq!(params.value("tag"), Some("abc"));
        assert_eq!(params.get("lr"), Some(None));
        assert_eq!(params.value("transport"), Some("UDP"));
        assert_eq!(params.to_string(), ";tag=abc;lr;Transport=UDP");
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut params = Params::parse("branch=z9hG4bK1;rport");
        params.set("rport", Some("5062"));
        params.set("received", Some("10.0.0.1"));
        assert_eq!(params.to_string(), ";branch=z9hG4bK1;rport=5062;received=10.0.0.1");
        params.remove("BRANCH");
        assert!(!params.contains("branch"));
    }

    #[test]
    fn test_split_respects_quotes_and_brackets() {
        let parts = split_outside_quotes("\"a, b\" <sip:x@y;lr>, <sip:z@w>", ',');
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].trim(), "<sip:z@w>");
    }
}
