use std::fmt;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// An ordered, case-insensitive header multimap.
///
/// Insertion order is preserved on output; lookups compare names without
/// case. Parsing folds continuation lines into the previous value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

fn eq_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| eq_name(k, key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| eq_name(k, key))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Append a field, preserving any existing ones of the same name.
    pub fn add(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_string(), value.to_string()));
    }

    /// Replace the first field of this name in place, or append one.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| eq_name(k, key)) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.add(key, value),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !eq_name(k, key));
    }

    /// Does the tokenized value of `key` contain `value`, compared without
    /// case? Commas and spaces separate tokens.
    pub fn key_contains(&self, key: &str, value: &str) -> bool {
        self.get_all(key).any(|header| {
            header
                .split(|c: char| c == ',' || c.is_whitespace())
                .any(|token| !token.is_empty() && token.eq_ignore_ascii_case(value))
        })
    }

    /// Should the connection close when this exchange is done?
    pub fn needs_close(&self) -> bool {
        self.key_contains("Connection", "close")
    }

    pub fn keep_alive(&self) -> bool {
        self.key_contains("Connection", "keep-alive")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set("Content-Type", content_type);
    }

    /// Parse a header block from `buf`, draining through the terminating
    /// empty line.
    ///
    /// Returns `Ok(false)` when the block is incomplete (no empty line
    /// within the buffered data). `max` bounds the total header bytes.
    pub fn parse(&mut self, buf: &Buffer, max: usize) -> Result<bool> {
        let mut bytes = 0usize;

        while !buf.is_empty() {
            let remaining = if max == 0 { 0 } else { max - bytes.min(max) };
            let line = match buf.read_line(remaining, b"\r\n")? {
                Some(line) => line,
                None => return Ok(false),
            };

            // Empty line ends the block.
            if line.is_empty() {
                return Ok(true);
            }

            bytes += line.len() + 2;
            if max != 0 && max < bytes {
                return Err(Error::Limit("header too long".into()));
            }

            // Continuation lines extend the previous value.
            if line.starts_with(' ') || line.starts_with('\t') {
                match self.entries.last_mut() {
                    Some(entry) => {
                        entry.1.push(' ');
                        entry.1.push_str(line.trim());
                        continue;
                    }
                    None => return Err(Error::Protocol(format!("invalid header line '{}'", line))),
                }
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("invalid header line '{}'", line)))?;
            self.add(key, value.trim());
        }

        Ok(false)
    }

    /// Serialize as wire lines, without the terminating empty line.
    pub fn write_to(&self, out: &mut String) {
        for (key, value) in self.iter() {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Headers {
        let buf = Buffer::from_bytes(data);
        let mut headers = Headers::new();
        assert!(headers.parse(&buf, 0).unwrap());
        headers
    }

    #[test]
    fn case_insensitive_lookup_preserves_value() {
        let h = parse(b"Content-Type: text/html\r\nX-Custom: a b\r\n\r\n");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("X-CUSTOM"), Some("a b"));
        assert!(h.get("missing").is_none());
    }

    #[test]
    fn insertion_order_preserved() {
        let h = parse(b"B: 2\r\nA: 1\r\nC: 3\r\n\r\n");
        let keys: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["B", "A", "C"]);

        let mut out = String::new();
        h.write_to(&mut out);
        assert_eq!(out, "B: 2\r\nA: 1\r\nC: 3\r\n");
    }

    #[test]
    fn continuation_lines_fold() {
        let h = parse(b"X-Long: first\r\n second\r\n\tthird\r\n\r\n");
        assert_eq!(h.get("X-Long"), Some("first second third"));
    }

    #[test]
    fn incomplete_block_returns_false() {
        let buf = Buffer::from_bytes(b"A: 1\r\nB: 2\r\n");
        let mut h = Headers::new();
        assert!(!h.parse(&buf, 0).unwrap());
    }

    #[test]
    fn malformed_line_is_an_error() {
        let buf = Buffer::from_bytes(b"not a header\r\n\r\n");
        let mut h = Headers::new();
        assert!(h.parse(&buf, 0).is_err());
    }

    #[test]
    fn connection_tokens() {
        let h = parse(b"Connection: keep-alive, Upgrade\r\n\r\n");
        assert!(h.keep_alive());
        assert!(h.key_contains("Connection", "upgrade"));
        assert!(!h.needs_close());

        let h = parse(b"Connection: close\r\n\r\n");
        assert!(h.needs_close());
    }

    #[test]
    fn multimap_and_set() {
        let mut h = Headers::new();
        h.add("Set-Cookie", "a=1");
        h.add("Set-Cookie", "b=2");
        assert_eq!(h.get_all("set-cookie").count(), 2);

        h.set("Host", "a");
        h.set("Host", "b");
        assert_eq!(h.get_all("host").count(), 1);
        assert_eq!(h.get("Host"), Some("b"));

        h.remove("Set-Cookie");
        assert!(!h.has("Set-Cookie"));
    }
}
