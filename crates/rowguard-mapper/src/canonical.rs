// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Canonical forms: text templates rendered against an entity to produce the
// exact bytes that get signed.
//
// Template syntax is literal text with `{{ ... }}` actions:
//
//   {{.Field}}          the field value
//   {{.Outer.Inner}}    a nested field
//   {{hash .Field}}     SHA-256 hex of the canonical JSON of the field
//   {{date .Field}}     the field as an RFC 3339 UTC timestamp, second precision
//
// Strings render raw, numbers and booleans in their JSON spelling, null as
// the empty string and arrays or objects as canonical JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use rowguard_core::error::{Result, RowguardError};
use rowguard_security::{canonical_json, hash_bytes, hash_json};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Declared forms
// ---------------------------------------------------------------------------

/// One canonical form template as declared by an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalForm(String);

impl CanonicalForm {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn template(&self) -> &str {
        &self.0
    }

    /// Identifier stored in the `signer` column of rows signed with this form.
    pub fn signer(&self) -> String {
        hash_bytes(self.0.as_bytes())
    }
}

impl From<&str> for CanonicalForm {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

/// Ordered canonical forms, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalForms(Vec<CanonicalForm>);

impl CanonicalForms {
    pub fn new<I, F>(forms: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<CanonicalForm>,
    {
        Self(forms.into_iter().map(Into::into).collect())
    }

    /// The signing form and the older forms still recognized.
    pub fn latest(&self) -> Option<(&CanonicalForm, &[CanonicalForm])> {
        self.0.split_first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalForm> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Compiled templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Helper {
    Print,
    Hash,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Action { helper: Helper, path: Vec<String> },
}

/// A parsed canonical form, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    signer: String,
    parts: Vec<Part>,
}

impl Template {
    /// Parse a template. Fails on unknown helpers, malformed field paths and
    /// unterminated actions.
    pub fn compile(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_owned()));
            }
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| {
                RowguardError::CanonicalForm(format!("unterminated action in {source:?}"))
            })?;
            parts.push(parse_action(&after[..close])?);
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_owned()));
        }

        Ok(Self {
            source: source.to_owned(),
            signer: hash_bytes(source.as_bytes()),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn signer(&self) -> &str {
        &self.signer
    }

    /// Top-level field names the template reads.
    pub fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Action { path, .. } => path.first().map(String::as_str),
            Part::Literal(_) => None,
        })
    }

    /// Render against the JSON projection of an entity.
    pub fn render(&self, value: &Value) -> Result<Vec<u8>> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Action { helper, path } => {
                    let field = lookup(value, path)?;
                    match helper {
                        Helper::Print => print_value(field, &mut out),
                        Helper::Hash => out.push_str(&hash_json(field)),
                        Helper::Date => out.push_str(&format_date(field, path)?),
                    }
                }
            }
        }
        Ok(out.into_bytes())
    }
}

fn parse_action(action: &str) -> Result<Part> {
    let tokens: Vec<&str> = action.split_whitespace().collect();
    let (helper, path) = match tokens.as_slice() {
        [path] => (Helper::Print, *path),
        ["hash", path] => (Helper::Hash, *path),
        ["date", path] => (Helper::Date, *path),
        [name, _] => {
            return Err(RowguardError::CanonicalForm(format!(
                "unknown function {name:?}"
            )));
        }
        _ => {
            return Err(RowguardError::CanonicalForm(format!(
                "malformed action {{{{{action}}}}}"
            )));
        }
    };

    let segments = path.strip_prefix('.').ok_or_else(|| {
        RowguardError::CanonicalForm(format!("expected a field path, got {path:?}"))
    })?;
    let path: Vec<String> = segments.split('.').map(str::to_owned).collect();
    if path.iter().any(String::is_empty) {
        return Err(RowguardError::CanonicalForm(format!(
            "empty segment in field path {segments:?}"
        )));
    }
    Ok(Part::Action { helper, path })
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Result<&'a Value> {
    path.iter().try_fold(value, |current, segment| {
        current.get(segment.as_str()).ok_or_else(|| {
            RowguardError::CanonicalForm(format!("no field .{}", path.join(".")))
        })
    })
}

fn print_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        Value::Bool(_) | Value::Number(_) => out.push_str(&value.to_string()),
        Value::Array(_) | Value::Object(_) => out.push_str(&canonical_json(value)),
    }
}

fn format_date(value: &Value, path: &[String]) -> Result<String> {
    let parsed = match value {
        Value::Null => return Ok(String::new()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        _ => None,
    };
    parsed
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| {
            RowguardError::CanonicalForm(format!(".{} is not a timestamp", path.join(".")))
        })
}
