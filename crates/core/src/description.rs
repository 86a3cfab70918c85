//! Pipeline descriptions: the human-readable chain syntax.
//!
//! ```text
//! testsrc num-buffers=10 width=64 height=64 ! nullcodec ! appsink
//! ( rtspsrc location="rtsp://camera/stream" ! rtph264depay ! h264parse ! rtph264pay name=pay0 pt=96 )
//! ```
//!
//! - Stages are separated by `!`, data flows left to right.
//! - Properties are `key=value`. Values are quoted strings, integers,
//!   `true`/`false`, or bare words (enum names, hosts, paths).
//! - `name=` sets the stage name instead of a property.
//! - The whole chain may be wrapped in parentheses.
//!
//! Parsing only checks syntax. Types, required properties and link
//! compatibility are checked when a [`PipelineGraph`](crate::PipelineGraph)
//! is built from the result.

use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, Result};
use crate::stage::{PropertyValue, StageSpec};

/// A parsed, ordered chain of stage specs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub stages: Vec<StageSpec>,
}

impl Description {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut body = input.trim();
        if let Some(inner) = body.strip_prefix('(') {
            body = inner
                .strip_suffix(')')
                .ok_or_else(|| RelayError::config("description", "unbalanced parenthesis"))?
                .trim();
        }
        if body.is_empty() {
            return Err(RelayError::config("description", "empty description"));
        }

        let stages = split_outside_quotes(body, '!')
            .into_iter()
            .enumerate()
            .map(|(index, segment)| parse_stage(index, segment))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { stages })
    }
}

impl FromStr for Description {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" ! ")?;
            }
            f.write_str(&stage.factory)?;
            if let Some(name) = &stage.name {
                if is_identifier(name) && !matches!(name.as_str(), "true" | "false") {
                    write!(f, " name={name}")?;
                } else {
                    write!(f, " name={}", PropertyValue::Str(name.clone()))?;
                }
            }
            for (key, value) in stage.properties.iter() {
                write!(f, " {key}={value}")?;
            }
        }
        Ok(())
    }
}

fn stage_label(index: usize, factory: Option<&str>) -> String {
    match factory {
        Some(factory) => format!("#{index} ({factory})"),
        None => format!("#{index}"),
    }
}

fn parse_stage(index: usize, segment: &str) -> Result<StageSpec> {
    let tokens = split_outside_quotes(segment.trim(), ' ');
    let mut tokens = tokens.into_iter().map(str::trim).filter(|t| !t.is_empty());

    let factory = tokens
        .next()
        .ok_or_else(|| RelayError::config(stage_label(index, None), "empty stage"))?;
    if !is_identifier(factory) {
        return Err(RelayError::config(
            stage_label(index, None),
            format!("'{factory}' is not a stage type"),
        ));
    }

    let label = || stage_label(index, Some(factory));
    let mut spec = StageSpec::new(factory);

    for token in tokens {
        let (key, raw) = token
            .split_once('=')
            .ok_or_else(|| RelayError::config(label(), format!("expected key=value, got '{token}'")))?;
        let key = key.trim();
        if !is_identifier(key) {
            return Err(RelayError::config(
                label(),
                format!("'{key}' is not a property name"),
            ));
        }
        let value = parse_value(raw.trim()).map_err(|reason| RelayError::config(label(), reason))?;

        if key == "name" {
            let name = value
                .as_str()
                .ok_or_else(|| RelayError::config(label(), "name must be a string"))?;
            spec.name = Some(name.to_string());
        } else {
            spec.properties.set(key, value);
        }
    }

    Ok(spec)
}

fn parse_value(raw: &str) -> std::result::Result<PropertyValue, String> {
    if let Some(quoted) = raw.strip_prefix('"') {
        let inner = quoted
            .strip_suffix('"')
            .ok_or_else(|| format!("unterminated string {raw}"))?;
        let mut value = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                value.push(chars.next().ok_or("dangling escape")?);
            } else {
                value.push(c);
            }
        }
        return Ok(PropertyValue::Str(value));
    }
    if raw.is_empty() {
        return Err("missing value".to_string());
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(PropertyValue::Int(i));
    }
    Ok(match raw {
        "true" => PropertyValue::Bool(true),
        "false" => PropertyValue::Bool(false),
        word => PropertyValue::Enum(word.to_string()),
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split on `sep`, ignoring separators inside double quotes.
fn split_outside_quotes(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            c if sep == ' ' && c.is_whitespace() && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_chain() {
        let d = Description::parse("testsrc num-buffers=10 width=64 ! nullcodec ! appsink").unwrap();
        assert_eq!(d.stages.len(), 3);
        assert_eq!(d.stages[0].factory, "testsrc");
        assert_eq!(d.stages[0].properties.int("num-buffers"), Some(10));
        assert_eq!(d.stages[2].factory, "appsink");
    }

    #[test]
    fn parse_restream_launch_line() {
        let d = Description::parse(
            "( rtspsrc location=rtsp://10.0.0.2:554/stream ! rtph264depay ! h264parse ! rtph264pay name=pay0 pt=96 )",
        )
        .unwrap();
        assert_eq!(d.stages.len(), 4);
        assert_eq!(
            d.stages[0].properties.str("location"),
            Some("rtsp://10.0.0.2:554/stream")
        );
        assert_eq!(d.stages[3].name.as_deref(), Some("pay0"));
        assert_eq!(d.stages[3].properties.int("pt"), Some(96));
    }

    #[test]
    fn quoted_values_may_contain_separators() {
        let d = Description::parse(r#"appsrc ! udpsink host="a ! b" port=5000"#).unwrap();
        assert_eq!(d.stages.len(), 2);
        assert_eq!(
            d.stages[1].properties.get("host"),
            Some(&PropertyValue::Str("a ! b".into()))
        );
    }

    #[test]
    fn errors_name_the_offending_stage() {
        let err = Description::parse("testsrc ! nullcodec width ! appsink").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("#1 (nullcodec)"), "{msg}");

        let err = Description::parse("testsrc ! ! appsink").unwrap_err();
        assert!(err.to_string().contains("#1"), "{err}");

        assert!(Description::parse("   ").is_err());
        assert!(Description::parse("( testsrc ! appsink").is_err());
        assert!(Description::parse(r#"udpsink host="oops"#).is_err());
    }

    #[test]
    fn display_parses_back_to_the_same_chain() {
        let text = r#"testsrc name=cam pattern=solid is-live=true ! videoconvert format=bgra ! appsink location="a \"b\"""#;
        let d = Description::parse(text).unwrap();
        let again = Description::parse(&d.to_string()).unwrap();
        assert_eq!(d, again);
    }

    #[test]
    fn quoted_names_survive_display() {
        for text in [
            r#"testsrc name="front cam" ! appsink"#,
            r#"testsrc name="a!b" ! appsink name="x=y""#,
            r#"testsrc name="say \"hi\"" ! appsink name="true""#,
        ] {
            let d = Description::parse(text).unwrap();
            let again = Description::parse(&d.to_string()).unwrap();
            assert_eq!(d, again, "{text}");
        }

        let d = Description::parse(r#"testsrc name="front cam" ! appsink"#).unwrap();
        assert_eq!(d.to_string(), r#"testsrc name="front cam" ! appsink"#);
    }
}
