//! Include directive scanning and splicing.
//!
//! ```text
//! {include file="header.tpl"}                 -> <root>/template/<theme>/header.tpl
//! {include file='nav.tpl' module="blog"}      -> <root>/module/blog/template/<theme>/nav.tpl
//! ```
//!
//! Single quotes are normalized to double quotes before attributes are read.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::ResolveError;

static RE_INCLUDE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{include(.*?)\}").unwrap());
static RE_FILE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"file="(.+?)""#).unwrap());
static RE_MODULE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"module="(.+?)""#).unwrap());

/// What an include directive points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeTarget {
    pub file: String,
    pub module: Option<String>,
}

impl IncludeTarget {
    /// Compose the on-disk path for this target.
    pub fn path(&self, root: &Path, theme: &str) -> PathBuf {
        match &self.module {
            Some(module) => root
                .join("module")
                .join(module)
                .join("template")
                .join(theme)
                .join(&self.file),
            None => root.join("template").join(theme).join(&self.file),
        }
    }
}

/// One directive occurrence in a document.
#[derive(Debug, Clone)]
pub struct Directive<'a> {
    /// Byte range of the whole directive in the document.
    pub span: Range<usize>,
    /// The literal directive text, e.g. `{include file="a.tpl"}`.
    pub literal: &'a str,
    /// Parsed target, or a pattern error if `file=` is missing.
    pub target: Result<IncludeTarget, ResolveError>,
}

/// Find every include directive, in document order.
pub fn scan(text: &str) -> Vec<Directive<'_>> {
    RE_INCLUDE
        .find_iter(text)
        .map(|m| Directive {
            span: m.range(),
            literal: m.as_str(),
            target: parse_target(m.as_str()),
        })
        .collect()
}

fn parse_target(literal: &str) -> Result<IncludeTarget, ResolveError> {
    let normalized = literal.replace('\'', "\"");

    let file = RE_FILE
        .captures(&normalized)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ResolveError::Pattern(literal.to_string()))?;
    let module = RE_MODULE.captures(&normalized).map(|c| c[1].to_string());

    Ok(IncludeTarget { file, module })
}

/// Replace each directive span with its resolved content.
///
/// `contents[i]` belongs to `directives[i]`; spans are in document order and
/// never overlap, so each occurrence lands exactly where it was written.
pub fn splice(text: &str, directives: &[Directive<'_>], contents: &[Arc<str>]) -> String {
    debug_assert_eq!(directives.len(), contents.len());

    let extra: usize = contents.iter().map(|c| c.len()).sum();
    let mut out = String::with_capacity(text.len() + extra);
    let mut cursor = 0;
    for (directive, content) in directives.iter().zip(contents) {
        out.push_str(&text[cursor..directive.span.start]);
        out.push_str(content);
        cursor = directive.span.end;
    }
    out.push_str(&text[cursor..]);
    out
}
