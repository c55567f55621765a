//! Dot-delimited state paths and subscription patterns.
//!
//! A [`StatePath`] names one slot in the state tree: `app.language`,
//! `ui.scrollPosition`. A [`Pattern`] is what listeners subscribe to; besides
//! literal segments it may contain:
//!
//! - `*`: exactly one segment (`ui.*` matches `ui.isLoading`, not `ui.a.b`)
//! - `**`: the remaining segments, zero or more; only valid last
//!   (`ui.**` is the whole `ui` section, `ui` included)

use std::fmt;

use crate::error::StateError;

pub const SEPARATOR: char = '.';
pub const SINGLE_WILDCARD: &str = "*";
pub const MULTI_WILDCARD: &str = "**";

/// A parsed, concrete state path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    raw: String,
    segments: Vec<String>,
}

impl StatePath {
    pub fn parse(path: &str) -> Result<Self, StateError> {
        if path.is_empty() {
            return Err(StateError::invalid_path(path, "path is empty"));
        }
        let mut segments = Vec::new();
        for segment in path.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(StateError::invalid_path(path, "empty segment"));
            }
            if segment.contains('*') {
                return Err(StateError::invalid_path(
                    path,
                    "wildcards are only allowed in subscription patterns",
                ));
            }
            segments.push(segment.to_string());
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, i.e. the section this path lives in.
    pub fn section(&self) -> &str {
        &self.segments[0]
    }

    /// The path made of the first `len` segments.
    pub fn prefix(&self, len: usize) -> String {
        self.segments[..len].join(".")
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One segment of a subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    Literal(String),
    /// `*`
    Any,
    /// `**`
    Rest,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, StateError> {
        if pattern.is_empty() {
            return Err(StateError::invalid_path(pattern, "pattern is empty"));
        }
        let parts: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(StateError::invalid_path(pattern, "empty segment")),
                SINGLE_WILDCARD => PatternSegment::Any,
                MULTI_WILDCARD if i == last => PatternSegment::Rest,
                MULTI_WILDCARD => {
                    return Err(StateError::invalid_path(
                        pattern,
                        "`**` must be the last segment",
                    ));
                }
                p if p.contains('*') => {
                    return Err(StateError::invalid_path(
                        pattern,
                        "`*` must stand alone in its segment",
                    ));
                }
                p => PatternSegment::Literal(p.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// True when the pattern contains no wildcard.
    pub fn is_concrete(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// Segment-wise match against a concrete path.
    pub fn matches(&self, path: &StatePath) -> bool {
        let mut segs = path.segments().iter();
        for seg in &self.segments {
            match seg {
                PatternSegment::Rest => return true,
                PatternSegment::Any => {
                    if segs.next().is_none() {
                        return false;
                    }
                }
                PatternSegment::Literal(lit) => match segs.next() {
                    Some(s) if s == lit => {}
                    _ => return false,
                },
            }
        }
        segs.next().is_none()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
