//! Unix-like string grammar for paths and path patterns.
//!
//! `/` separates components, a leading `:` marks an atom identifier, a bare
//! `*` is wildcard-one, a bare `**` is wildcard-any-depth, and `\` escapes
//! the next character. The empty string and `"/"` both denote the root.

use crate::error::ArborError;
use crate::path::pattern::{Condition, PathPattern, PatternComponent};
use crate::path::{NodeId, Path};

struct RawComponent {
    text: String,
    had_escape: bool,
}

fn split_components(input: &str) -> Result<Vec<RawComponent>, ArborError> {
    let mut components = Vec::new();
    let mut text = String::new();
    let mut had_escape = false;
    let mut chars = input.chars();

    loop {
        match chars.next() {
            None => break,
            Some('\\') => match chars.next() {
                Some(escaped) => {
                    text.push(escaped);
                    had_escape = true;
                }
                None => {
                    return Err(ArborError::Validation(format!(
                        "trailing escape in path string {input:?}"
                    )));
                }
            },
            Some('/') => {
                if !text.is_empty() {
                    components.push(RawComponent {
                        text: std::mem::take(&mut text),
                        had_escape,
                    });
                }
                had_escape = false;
            }
            Some(c) => text.push(c),
        }
    }
    if !text.is_empty() {
        components.push(RawComponent { text, had_escape });
    }
    Ok(components)
}

/// Parses a pattern string. Empty components (duplicate, leading or
/// trailing slashes) are ignored; `""` and `"/"` parse to the root.
pub fn parse(input: &str) -> Result<PathPattern, ArborError> {
    let mut components = Vec::new();
    for raw in split_components(input)? {
        let component = if !raw.had_escape && raw.text == "*" {
            PatternComponent::Cond(Condition::AnyName)
        } else if !raw.had_escape && raw.text == "**" {
            PatternComponent::Cond(Condition::AnySubpath)
        } else if let Some(name) = raw.text.strip_prefix(':').filter(|_| !raw.had_escape) {
            if name.is_empty() {
                return Err(ArborError::Validation(format!(
                    "empty atom name in path string {input:?}"
                )));
            }
            PatternComponent::Id(NodeId::atom(name))
        } else {
            PatternComponent::Id(NodeId::from(raw.text))
        };
        components.push(component);
    }
    Ok(PathPattern::new(components))
}

/// Parses a concrete path: like [`parse`] but wildcards are rejected.
pub fn parse_path(input: &str) -> Result<Path, ArborError> {
    let pattern = parse(input)?;
    let mut ids = Vec::with_capacity(pattern.len());
    for component in pattern.components() {
        match component {
            PatternComponent::Id(id) => ids.push(id.clone()),
            PatternComponent::Cond(c) => {
                return Err(ArborError::Validation(format!(
                    "path string {input:?} contains a pattern component ({c})"
                )));
            }
        }
    }
    Ok(Path::new(ids))
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == '\\' || c == '/' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn render_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    escape_into(&mut out, text);
    if out == "*" || out == "**" || out.starts_with(':') {
        out.insert(0, '\\');
    }
    out
}

/// Renders a pattern back into the string grammar. Returns `None` for
/// patterns the grammar cannot express: structured conditions, non-UTF-8
/// byte identifiers, and empty identifiers.
pub fn render(pattern: &PathPattern) -> Option<String> {
    if pattern.is_empty() {
        return Some("/".to_string());
    }
    let mut out = String::new();
    for component in pattern.components() {
        out.push('/');
        match component {
            PatternComponent::Id(NodeId::Atom(name)) => {
                if name.is_empty() {
                    return None;
                }
                out.push(':');
                escape_into(&mut out, name);
            }
            PatternComponent::Id(NodeId::Bytes(bytes)) => {
                let text = std::str::from_utf8(bytes).ok()?;
                if text.is_empty() {
                    return None;
                }
                out.push_str(&render_literal(text));
            }
            PatternComponent::Cond(Condition::AnyName) => out.push('*'),
            PatternComponent::Cond(Condition::AnySubpath) => out.push_str("**"),
            PatternComponent::Cond(_) => return None,
        }
    }
    Some(out)
}

/// Renders a concrete path; `None` under the same limits as [`render`].
pub fn render_path(path: &Path) -> Option<String> {
    render(&PathPattern::from_path(path))
}
