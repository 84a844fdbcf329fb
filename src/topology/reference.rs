//! Placeholder parsing for environment values.
//!
//! Environment values may embed `{resource.property}` placeholders. A value
//! is split into literal text and placeholders so the synthesizer can render
//! each part and the topology can check every target exists.

use serde::Serialize;

/// A parsed piece of an environment value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Segment<'a> {
    /// Verbatim text.
    Literal(&'a str),
    /// A `{target.property}` placeholder.
    Placeholder {
        /// Name of the referenced resource.
        target: &'a str,
        /// Property path on the referenced resource, for example
        /// `connectionString` or `bindings.http.url`.
        property: &'a str,
    },
}

/// A resolved dependency edge declared by an environment entry.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Reference {
    /// Resource declaring the environment entry.
    pub from: String,
    /// Environment key carrying the placeholder.
    pub key: String,
    /// Referenced resource.
    pub target: String,
    /// Referenced property.
    pub property: String,
}

/// Splits a value into literal and placeholder segments.
///
/// # Errors
///
/// Returns a diagnostic message when a brace is left open or a placeholder
/// lacks a `target.property` shape.
pub fn parse_segments(value: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = value;

    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        let body = tail.get(1..).unwrap_or_default();
        let Some(close) = body.find('}') else {
            return Err(format!("unterminated placeholder in {value:?}"));
        };
        let (inner, after) = body.split_at(close);
        segments.push(parse_placeholder(inner)?);
        rest = after.get(1..).unwrap_or_default();
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

fn parse_placeholder(inner: &str) -> Result<Segment<'_>, String> {
    let Some((target, property)) = inner.split_once('.') else {
        return Err(format!("placeholder {{{inner}}} must be shaped as {{resource.property}}"));
    };
    if target.trim().is_empty() || property.trim().is_empty() {
        return Err(format!("placeholder {{{inner}}} has an empty resource or property"));
    }
    if target.contains('{') {
        return Err(format!("nested placeholder in {{{inner}}}"));
    }
    Ok(Segment::Placeholder {
        target: target.trim(),
        property: property.trim(),
    })
}
