use std::any::Any;

use gst::prelude::*;
use relay::{Element, Factory, PixelFormat, PropertyValue, RelayError};

use crate::element_name;

/// Caps settings kept aside for stages whose properties GStreamer expresses
/// as caps rather than element properties.
#[derive(Debug, Default, Clone)]
struct RawCaps {
    format: Option<PixelFormat>,
    width: Option<i32>,
    height: Option<i32>,
    framerate: Option<i32>,
}

impl RawCaps {
    fn build(&self) -> gst::Caps {
        let mut caps = gst::Caps::builder("video/x-raw");
        if let Some(format) = self.format {
            caps = caps.field("format", format.as_str());
        }
        if let Some(width) = self.width {
            caps = caps.field("width", width);
        }
        if let Some(height) = self.height {
            caps = caps.field("height", height);
        }
        if let Some(rate) = self.framerate {
            caps = caps.field("framerate", gst::Fraction::new(rate, 1));
        }
        caps.build()
    }
}

/// One stage's GStreamer elements.
///
/// Most stages are a single element. `testsrc` adds a `capsfilter` behind
/// its source to carry size, format and rate.
pub(crate) struct GstElement {
    stage: String,
    factory: &'static str,
    pub(crate) head: gst::Element,
    pub(crate) tail: gst::Element,
    caps: RawCaps,
}

impl GstElement {
    pub(crate) fn new(stage: &str, factory: &'static Factory) -> relay::Result<Self> {
        let make = |kind: &str, name: &str| {
            gst::ElementFactory::make(kind)
                .name(name)
                .build()
                .map_err(|e| RelayError::Configuration {
                    stage: stage.to_string(),
                    reason: format!("cannot create {kind}: {e}"),
                })
        };

        let head = make(element_name(factory.name), stage)?;
        let tail = match factory.name {
            "testsrc" => make("capsfilter", &format!("{stage}-caps"))?,
            _ => head.clone(),
        };
        if factory.name == "appsink" {
            let caps = gst::Caps::builder("video/x-raw")
                .field(
                    "format",
                    gst::List::new(PixelFormat::ALL.iter().map(|f| f.as_str())),
                )
                .build();
            head.set_property("caps", &caps);
            head.set_property("emit-signals", false);
        }
        if factory.name == "appsrc" {
            head.set_property("format", gst::Format::Time);
            head.set_property("do-timestamp", true);
        }

        Ok(Self {
            stage: stage.to_string(),
            factory: factory.name,
            head,
            tail,
            caps: RawCaps::default(),
        })
    }

    /// Every element belonging to this stage, upstream first.
    pub(crate) fn members(&self) -> Vec<gst::Element> {
        if self.head == self.tail {
            vec![self.head.clone()]
        } else {
            vec![self.head.clone(), self.tail.clone()]
        }
    }

    fn config_error(&self, reason: impl Into<String>) -> RelayError {
        RelayError::Configuration {
            stage: self.stage.clone(),
            reason: reason.into(),
        }
    }

    /// Properties that live in caps on `testsrc` and `appsrc`.
    fn set_caps_field(&mut self, name: &str, value: &PropertyValue) -> relay::Result<bool> {
        if !matches!(self.factory, "testsrc" | "appsrc") {
            return Ok(false);
        }
        let int = || {
            value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| self.config_error(format!("{name} must be a positive integer")))
        };
        match name {
            "width" => self.caps.width = Some(int()?),
            "height" => self.caps.height = Some(int()?),
            "framerate" => self.caps.framerate = Some(int()?),
            "format" => {
                let format = value
                    .as_str()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| self.config_error(format!("unknown pixel format {value}")))?;
                self.caps.format = Some(format);
            }
            _ => return Ok(false),
        }
        let target = if self.factory == "testsrc" {
            &self.tail
        } else {
            &self.head
        };
        target.set_property("caps", &self.caps.build());
        Ok(true)
    }
}

impl Element for GstElement {
    fn set_property(&mut self, name: &str, value: &PropertyValue) -> relay::Result<()> {
        if self.set_caps_field(name, value)? {
            return Ok(());
        }
        let (name, text) = match (self.factory, name, value) {
            // The core queue is the buffer limit for application ports.
            ("appsink" | "appsrc", "max-buffers" | "drop", _) => return Ok(()),
            ("testsrc", "pattern", v) if v.as_str() == Some("counter") => ("pattern", "smpte".to_string()),
            ("testsrc", "pattern", v) if v.as_str() == Some("solid") => {
                ("pattern", "solid-color".to_string())
            }
            (_, name, PropertyValue::Str(s) | PropertyValue::Enum(s)) => (name, s.clone()),
            (_, name, v) => (name, v.to_string()),
        };
        if self.head.find_property(name).is_none() {
            return Err(self.config_error(format!("{} has no property '{name}'", self.factory)));
        }
        self.head.set_property_from_str(name, &text);
        tracing::trace!(stage = %self.stage, property = name, value = %text, "property set");
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
