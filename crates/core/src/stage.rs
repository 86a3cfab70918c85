//! Stages: one processing unit of a chain.
//!
//! A [`Stage`] pairs the engine-neutral configuration (factory, name,
//! typed properties, negotiated formats) with an opaque [`Element`] owned by
//! whichever [`Engine`](crate::engine::Engine) built it. The orchestration
//! core only ever talks to the element through this trait; engines downcast
//! their own elements when they assemble a chain.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::{Factory, PropType};
use crate::error::{RelayError, Result};
use crate::format::Format;

/// Position of a stage in the data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Source,
    Filter,
    Codec,
    Sink,
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// One of a fixed set of names (`pattern=smpte`, `format=bgra`).
    Enum(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(s) | Self::Enum(s) => s.parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Str(s) | Self::Enum(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
        }
    }

    /// Convert to the declared type of a property, if the value allows it.
    pub(crate) fn coerce(&self, ty: PropType) -> Option<PropertyValue> {
        match ty {
            PropType::Str => match self {
                Self::Str(s) | Self::Enum(s) => Some(Self::Str(s.clone())),
                Self::Int(i) => Some(Self::Str(i.to_string())),
                Self::Bool(b) => Some(Self::Str(b.to_string())),
            },
            PropType::Int => self.as_i64().map(Self::Int),
            PropType::Bool => self.as_bool().map(Self::Bool),
            PropType::Enum(choices) => {
                let s = self.as_str()?;
                choices
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(s))
                    .map(|c| Self::Enum((*c).to_string()))
            }
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Enum(s) => f.write_str(s),
        }
    }
}

/// Ordered property map. Insertion order is preserved so descriptions
/// serialize back the way they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<(String, PropertyValue)>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Replace an existing value in place, or append.
    pub fn set(&mut self, name: &str, value: PropertyValue) {
        match self.0.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn with(mut self, name: &str, value: PropertyValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropertyValue::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(PropertyValue::as_i64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PropertyValue::as_bool)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Declarative description of one stage, before any engine is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Factory (stage type) name, e.g. `testsrc` or `avdec_h264`.
    pub factory: String,
    /// Explicit stage name; generated as `<factory><index>` when absent.
    pub name: Option<String>,
    pub properties: Properties,
}

impl StageSpec {
    pub fn new(factory: &str) -> Self {
        Self {
            factory: factory.to_string(),
            name: None,
            properties: Properties::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn prop(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.set(name, value);
        self
    }
}

/// Engine-side half of a stage.
///
/// Implemented by each engine for the elements it creates. Only
/// configuration goes through this trait; data flow is the engine's business.
pub trait Element: Send + 'static {
    /// Apply one (already type-checked) property.
    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared handle to an element. The graph's stage and the engine's driver
/// both hold one; the driver locks it while moving data through.
pub type ElementHandle = Arc<Mutex<Box<dyn Element>>>;

/// One built, negotiated stage of a [`PipelineGraph`](crate::PipelineGraph).
pub struct Stage {
    name: String,
    factory: &'static Factory,
    properties: Properties,
    input: Option<Format>,
    output: Format,
    element: ElementHandle,
    locked: bool,
}

impl Stage {
    pub(crate) fn new(
        name: String,
        factory: &'static Factory,
        properties: Properties,
        input: Option<Format>,
        output: Format,
        element: Box<dyn Element>,
    ) -> Self {
        Self {
            name,
            factory,
            properties,
            input,
            output,
            element: Arc::new(Mutex::new(element)),
            locked: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &'static Factory {
        self.factory
    }

    pub fn kind(&self) -> StageKind {
        self.factory.kind
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Format negotiated on the incoming link (`None` for sources).
    pub fn input_format(&self) -> Option<Format> {
        self.input
    }

    pub fn output_format(&self) -> Format {
        self.output
    }

    pub fn element(&self) -> ElementHandle {
        self.element.clone()
    }

    /// Change one property. Rejected once the owning graph is playing.
    pub fn configure(&mut self, name: &str, value: PropertyValue) -> Result<()> {
        if self.locked {
            return Err(RelayError::StageLocked(self.name.clone()));
        }
        let value = self.factory.check_property(&self.name, name, &value)?;
        self.element.lock().set_property(name, &value)?;
        tracing::debug!(stage = %self.name, property = name, %value, "stage configured");
        self.properties.set(name, value);
        Ok(())
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Spec that rebuilds this stage with its current configuration.
    pub fn spec(&self) -> StageSpec {
        StageSpec {
            factory: self.factory.name.to_string(),
            name: Some(self.name.clone()),
            properties: self.properties.clone(),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("factory", &self.factory.name)
            .field("properties", &self.properties)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_keep_insertion_order() {
        let mut props = Properties::new()
            .with("width", PropertyValue::Int(64))
            .with("height", PropertyValue::Int(32));
        props.set("width", PropertyValue::Int(128));
        let keys: Vec<_> = props.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["width", "height"]);
        assert_eq!(props.int("width"), Some(128));
    }

    #[test]
    fn coerce_to_declared_type() {
        let bare = PropertyValue::Enum("5000".into());
        assert_eq!(bare.coerce(PropType::Int), Some(PropertyValue::Int(5000)));
        assert_eq!(
            bare.coerce(PropType::Str),
            Some(PropertyValue::Str("5000".into()))
        );
        assert_eq!(
            PropertyValue::Enum("BGRA".into()).coerce(PropType::Enum(&["rgb", "bgra"])),
            Some(PropertyValue::Enum("bgra".into()))
        );
        assert_eq!(PropertyValue::Str("x".into()).coerce(PropType::Bool), None);
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let v = PropertyValue::Str(r#"say "hi""#.into());
        assert_eq!(v.to_string(), r#""say \"hi\"""#);
        assert_eq!(PropertyValue::Enum("smpte".into()).to_string(), "smpte");
    }
}
