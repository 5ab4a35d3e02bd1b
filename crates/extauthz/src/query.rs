//! Entry point references
//!
//! The entry point is the document whose value is the decision for each
//! call. It is configured either as a slash-separated path under the root
//! `data` document or, for older deployments, as a query string. Both forms
//! resolve to the same [`EntryPoint`] reference.

use std::fmt;

use crate::error::{ExtAuthzError, Result};

/// Root document every path is resolved under
pub const ROOT_DOCUMENT: &str = "data";

/// One element of a reference after the root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefTerm {
    /// Object key
    Key(String),
    /// Array index
    Index(i64),
}

/// A reference into the root document, e.g. `data.envoy.authz.allow`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    terms: Vec<RefTerm>,
}

impl EntryPoint {
    /// Resolve a slash-separated path such as `envoy/authz/allow`
    ///
    /// Empty segments are skipped. Segments that parse as integers become
    /// array indices.
    pub fn from_path(path: &str) -> Self {
        let terms = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.parse::<i64>() {
                Ok(index) => RefTerm::Index(index),
                Err(_) => RefTerm::Key(segment.to_string()),
            })
            .collect();
        Self { terms }
    }

    /// Parse a reference query such as `data.envoy.authz["allow"]`
    pub fn parse(query: &str) -> Result<Self> {
        RefParser::new(query.trim()).parse()
    }

    /// Reference elements after the root document
    pub fn terms(&self) -> &[RefTerm] {
        &self.terms
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ROOT_DOCUMENT)?;
        for term in &self.terms {
            match term {
                RefTerm::Key(k) if is_identifier(k) => write!(f, ".{}", k)?,
                RefTerm::Key(k) => write!(f, "[{}]", quote(k))?,
                RefTerm::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote(s: &str) -> String {
    // serde_json produces a valid Rego string literal
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

struct RefParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> RefParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse(mut self) -> Result<EntryPoint> {
        let head = self.identifier()?;
        if head != ROOT_DOCUMENT {
            return Err(self.error(&format!(
                "query must be a reference into {}, found {:?}",
                ROOT_DOCUMENT, head
            )));
        }

        let mut terms = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.pos += 1;
                    terms.push(RefTerm::Key(self.identifier()?));
                }
                '[' => {
                    self.pos += 1;
                    terms.push(self.bracket()?);
                }
                _ => return Err(self.error(&format!("unexpected {:?}", c))),
            }
        }
        Ok(EntryPoint { terms })
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn identifier(&mut self) -> Result<String> {
        let src: &'a str = self.src;
        let rest = &src[self.pos..];
        let len = rest
            .char_indices()
            .take_while(|(i, c)| {
                c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit())
            })
            .count();
        if len == 0 {
            return Err(self.error("expected identifier"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn bracket(&mut self) -> Result<RefTerm> {
        let src: &'a str = self.src;
        let rest = &src[self.pos..];
        let start = rest.len() - rest.trim_start().len();
        let quoted = rest[start..].starts_with('"');

        // `]` may appear inside a quoted key
        let search_from = if quoted {
            let len = closing_quote(&rest[start..])
                .ok_or_else(|| self.error("unterminated string key"))?;
            start + len
        } else {
            0
        };
        let end = search_from
            + rest[search_from..]
                .find(']')
                .ok_or_else(|| self.error("unterminated '['"))?;
        let inner = rest[..end].trim();
        self.pos += end + 1;

        if quoted {
            let key: String = serde_json::from_str(inner)
                .map_err(|e| self.error(&format!("invalid string key: {}", e)))?;
            return Ok(RefTerm::Key(key));
        }
        inner
            .parse::<i64>()
            .map(RefTerm::Index)
            .map_err(|_| self.error(&format!("invalid index {:?}", inner)))
    }

    fn error(&self, msg: &str) -> ExtAuthzError {
        ExtAuthzError::config(format!(
            "failed to parse query {:?} at offset {}: {}",
            self.src, self.pos, msg
        ))
    }
}

/// Byte offset just past the string literal opening `s`
fn closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i + 1),
            _ => {}
        }
    }
    None
}
