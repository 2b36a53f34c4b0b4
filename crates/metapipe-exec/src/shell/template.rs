//! Command templates with `{name}` / `{name|transform}` placeholders.

use std::sync::OnceLock;

use metapipe_core::domain::{split_components, FileEntry};
use regex::Regex;
use serde_json::Value;

const PLACEHOLDER: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)(?:\|([A-Za-z_][A-Za-z0-9_]*))?\}";

fn placeholder_re() -> Result<&'static Regex, TemplateError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER))
        .as_ref()
        .map_err(|e| TemplateError::Pattern(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown placeholder `{name}` in template {template:?}")]
    UnknownName { name: String, template: String },

    #[error("unknown transform `{transform}` in template {template:?}")]
    UnknownTransform { transform: String, template: String },

    #[error("placeholder pattern failed to compile: {0}")]
    Pattern(String),
}

/// Values a placeholder can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Value,
    Locator,
    Index,
    Path,
    RelPath,
    Dir,
    Base,
    Name,
    Ext,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "value" => Field::Value,
            "locator" => Field::Locator,
            "index" => Field::Index,
            "path" => Field::Path,
            "relPath" => Field::RelPath,
            "dir" => Field::Dir,
            "base" => Field::Base,
            "name" => Field::Name,
            "ext" => Field::Ext,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// JSON-encode the value.
    Json,
    /// Never shell-quote.
    Raw,
    /// Always shell-quote, also in argv templates.
    Quote,
}

impl Transform {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "json" => Transform::Json,
            "raw" => Transform::Raw,
            "quote" => Transform::Quote,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder {
        field: Field,
        transform: Option<Transform>,
    },
}

/// How rendered placeholders are quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// Shell-quote unless the `raw` transform is used.
    Auto,
    /// Quote only when the `quote` transform is used.
    Explicit,
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Inputs a template renders from.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateContext {
    pub value: Value,
    pub locator: String,
    pub index: usize,
    pub path: String,
    pub rel_path: String,
    pub dir: String,
    pub base: String,
    pub name: String,
    pub ext: String,
}

impl TemplateContext {
    /// Context for a record; path fields derive from the locator.
    pub fn for_record(locator: &str, index: usize, value: Value) -> Self {
        let (dir, base, name, ext) = split_components(locator);
        Self {
            value,
            locator: locator.to_string(),
            index,
            path: locator.to_string(),
            rel_path: locator.to_string(),
            dir,
            base,
            name,
            ext,
        }
    }

    /// Context for a raw file; `locator` is its relative path.
    pub fn for_file(file: &FileEntry, index: usize, value: Value) -> Self {
        Self {
            value,
            locator: file.rel_path.clone(),
            index,
            path: file.path.clone(),
            rel_path: file.rel_path.clone(),
            dir: file.dir.clone(),
            base: file.base.clone(),
            name: file.name.clone(),
            ext: file.ext.clone(),
        }
    }

    fn json(&self, field: Field) -> Value {
        match field {
            Field::Value => self.value.clone(),
            Field::Index => Value::from(self.index),
            other => Value::String(self.text(other)),
        }
    }

    fn text(&self, field: Field) -> String {
        match field {
            Field::Value => match &self.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Field::Locator => self.locator.clone(),
            Field::Index => self.index.to_string(),
            Field::Path => self.path.clone(),
            Field::RelPath => self.rel_path.clone(),
            Field::Dir => self.dir.clone(),
            Field::Base => self.base.clone(),
            Field::Name => self.name.clone(),
            Field::Ext => self.ext.clone(),
        }
    }
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`. Under `strict`, unknown names or transforms are errors;
    /// otherwise they stay in the output verbatim.
    pub fn parse(source: &str, strict: bool) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in placeholder_re()?.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }
            last = whole.end();

            let name = caps.get(1).map_or("", |m| m.as_str());
            let transform_name = caps.get(2).map(|m| m.as_str());

            let field = Field::parse(name);
            let transform = transform_name.map(|t| (t, Transform::parse(t)));

            match (field, transform) {
                (Some(field), None) => segments.push(Segment::Placeholder {
                    field,
                    transform: None,
                }),
                (Some(field), Some((_, Some(t)))) => segments.push(Segment::Placeholder {
                    field,
                    transform: Some(t),
                }),
                (None, _) if strict => {
                    return Err(TemplateError::UnknownName {
                        name: name.to_string(),
                        template: source.to_string(),
                    })
                }
                (Some(_), Some((t, None))) if strict => {
                    return Err(TemplateError::UnknownTransform {
                        transform: t.to_string(),
                        template: source.to_string(),
                    })
                }
                _ => segments.push(Segment::Literal(whole.as_str().to_string())),
            }
        }
        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, ctx: &TemplateContext, quoting: Quoting) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { field, transform } => {
                    let text = match transform {
                        Some(Transform::Json) => ctx.json(*field).to_string(),
                        _ => ctx.text(*field),
                    };
                    let quote = match transform {
                        Some(Transform::Raw) => false,
                        Some(Transform::Quote) => true,
                        _ => quoting == Quoting::Auto,
                    };
                    if quote {
                        out.push_str(&shell_quote(&text));
                    } else {
                        out.push_str(&text);
                    }
                }
            }
        }
        out
    }
}
