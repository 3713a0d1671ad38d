//! Named script bodies with `{{.Name}}` placeholders.

use std::io::Cursor;

use serde_json::Value;

use super::{Script, ScriptError, ScriptIdentity, ScriptReader, Shell};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

/// A script body parsed once at construction and rendered per run.
///
/// Placeholders take the form `{{.Name}}` (whitespace inside the braces is
/// allowed). A malformed body does not panic or fail construction; the
/// problem is kept as the script's parse error and surfaces when a session
/// is built from it.
///
/// # Example
///
/// ```ignore
/// let script = ScriptTemplate::new("ls", Shell::Bash, "ls -la {{.Path}}\n");
/// let session = Session::new(&descriptor, &script, &json!({ "Path": "/tmp" })).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    identity: ScriptIdentity,
    segments: Vec<Segment>,
    parse_error: Option<ScriptError>,
}

impl ScriptTemplate {
    pub fn new(name: impl Into<String>, shell: Shell, body: impl AsRef<str>) -> Self {
        let (segments, parse_error) = match parse(body.as_ref()) {
            Ok(segments) => (segments, None),
            Err(e) => (Vec::new(), Some(e)),
        };

        Self {
            identity: ScriptIdentity::new(name, shell),
            segments,
            parse_error,
        }
    }

    /// Render the body against a JSON object of arguments.
    pub fn render(&self, arguments: &Value) -> Result<String, ScriptError> {
        if let Some(e) = &self.parse_error {
            return Err(e.clone());
        }

        let fields = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(ScriptError::ArgumentsNotObject {
                    kind: json_kind(other),
                });
            }
        };

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = fields.and_then(|map| map.get(name)).ok_or_else(|| {
                        ScriptError::MissingArgument { name: name.clone() }
                    })?;
                    match value {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Script for ScriptTemplate {
    fn identity(&self) -> &ScriptIdentity {
        &self.identity
    }

    fn command(&self) -> String {
        self.identity.shell.command().to_string()
    }

    fn reader(&self, arguments: &Value) -> Result<ScriptReader, ScriptError> {
        let rendered = self.render(arguments)?;
        Ok(Box::new(Cursor::new(rendered.into_bytes())))
    }

    fn parse_error(&self) -> Option<&ScriptError> {
        self.parse_error.as_ref()
    }
}

fn parse(body: &str) -> Result<Vec<Segment>, ScriptError> {
    let mut segments = Vec::new();
    let mut rest = body;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let open = offset + start;
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(ScriptError::Unterminated { offset: open })?;

        let inner = after_open[..end].trim();
        let name = inner
            .strip_prefix('.')
            .filter(|name| is_identifier(name))
            .ok_or_else(|| ScriptError::InvalidPlaceholder {
                text: inner.to_string(),
                offset: open,
            })?;
        segments.push(Segment::Field(name.to_string()));

        let consumed = start + 2 + end + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
