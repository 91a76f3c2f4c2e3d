//! Service endpoint patterns
//!
//! A pattern is an absolute path whose segments must match the request path
//! one for one. `*` matches any single segment and `{name}` matches any single
//! segment while capturing it. `/chat` therefore never matches `/chatroom` or
//! `/chat/history`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors building a service pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Service pattern must start with '/': {0}")]
    NotAbsolute(String),

    #[error("Service pattern contains an empty capture name: {0}")]
    EmptyCapture(String),

    #[error("Service pattern contains a query string: {0}")]
    HasQuery(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    Capture(String),
}

/// A compiled service endpoint pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePattern {
    source: String,
    segments: Vec<Segment>,
}

impl ServicePattern {
    /// Compile a pattern such as `/chat` or `/rooms/{room}`
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') {
            return Err(PatternError::NotAbsolute(pattern.to_string()));
        }
        if pattern.contains('?') {
            return Err(PatternError::HasQuery(pattern.to_string()));
        }

        let mut segments = Vec::new();
        for part in split_segments(pattern) {
            let segment = if part == "*" {
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(PatternError::EmptyCapture(pattern.to_string()));
                }
                Segment::Capture(name.to_string())
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a request path (query already removed)
    ///
    /// Returns the captured segments in pattern order on success.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = split_segments(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captures = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Wildcard => {}
                Segment::Capture(name) => captures.push((name.clone(), part.to_string())),
            }
        }
        Some(captures)
    }
}

impl FromStr for ServicePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServicePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Path segments with a single trailing slash ignored
///
/// `/` yields no segments; interior empty segments (`/a//b`) are kept so they
/// never match a literal.
fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let empty = trimmed.is_empty();
    trimmed.split('/').filter(move |_| !empty)
}
