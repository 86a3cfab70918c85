//! Stage factories known to the core.
//!
//! Each [`Factory`] declares its kind, its property schema and how it
//! transforms the format of its incoming link. Build-time validation uses
//! this table independently of the engine that will eventually run the
//! chain, so a bad description fails the same way on every engine.

use crate::error::{RelayError, Result};
use crate::format::{Codec, Format, PixelFormat};
use crate::stage::{Properties, PropertyValue, StageKind};

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropType {
    Str,
    Int,
    Bool,
    Enum(&'static [&'static str]),
}

#[derive(Debug)]
pub struct PropSpec {
    pub name: &'static str,
    pub ty: PropType,
    pub required: bool,
}

const fn opt(name: &'static str, ty: PropType) -> PropSpec {
    PropSpec {
        name,
        ty,
        required: false,
    }
}

const fn req(name: &'static str, ty: PropType) -> PropSpec {
    PropSpec {
        name,
        ty,
        required: true,
    }
}

/// Which side of the application boundary a stage exposes, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPort {
    /// Frames leave the graph here (pull or callback delivery).
    Sink,
    /// Frames enter the graph here (injection).
    Source,
}

type Negotiate = fn(Option<Format>, &Properties) -> std::result::Result<Format, String>;

/// A stage type.
#[derive(Debug)]
pub struct Factory {
    pub name: &'static str,
    pub kind: StageKind,
    pub properties: &'static [PropSpec],
    pub app_port: Option<AppPort>,
    negotiate: Negotiate,
}

impl Factory {
    /// Type-check one property against the schema.
    pub fn check_property(
        &self,
        stage: &str,
        name: &str,
        value: &PropertyValue,
    ) -> Result<PropertyValue> {
        let spec = self
            .properties
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                RelayError::config(stage, format!("{} has no property '{name}'", self.name))
            })?;
        value.coerce(spec.ty).ok_or_else(|| {
            RelayError::config(
                stage,
                format!("value {value} is not valid for '{name}' ({:?})", spec.ty),
            )
        })
    }

    /// Type-check a whole property set and make sure required ones are there.
    pub fn check_properties(&self, stage: &str, props: &Properties) -> Result<Properties> {
        let mut checked = Properties::new();
        for (name, value) in props.iter() {
            checked.set(name, self.check_property(stage, name, value)?);
        }
        if let Some(missing) = self
            .properties
            .iter()
            .find(|p| p.required && checked.get(p.name).is_none())
        {
            return Err(RelayError::config(
                stage,
                format!("required property '{}' is missing", missing.name),
            ));
        }
        Ok(checked)
    }

    /// Output format given the incoming one, or why the link is impossible.
    pub fn negotiate(
        &self,
        input: Option<Format>,
        props: &Properties,
    ) -> std::result::Result<Format, String> {
        (self.negotiate)(input, props)
    }
}

/// Look up a factory by name.
pub fn lookup(name: &str) -> Option<&'static Factory> {
    FACTORIES.iter().find(|f| f.name == name)
}

/// All known factories.
pub fn factories() -> &'static [Factory] {
    FACTORIES
}

const PIXEL_FORMATS: &[&str] = &["rgb", "bgr", "rgba", "bgra", "gray8"];

fn pixel_format(props: &Properties) -> std::result::Result<Option<PixelFormat>, String> {
    props.str("format").map(str::parse::<PixelFormat>).transpose()
}

fn expect(input: Option<Format>, accepted: Format) -> std::result::Result<Format, String> {
    match input {
        Some(f) if f.fits(accepted) => Ok(f),
        Some(f) => Err(format!("cannot accept {f}, expected {accepted}")),
        None => Err("has no upstream".to_string()),
    }
}

fn test_source(_: Option<Format>, props: &Properties) -> std::result::Result<Format, String> {
    Ok(Format::Raw(pixel_format(props)?.unwrap_or(PixelFormat::Rgb)))
}

fn app_source(_: Option<Format>, props: &Properties) -> std::result::Result<Format, String> {
    Ok(pixel_format(props)?.map_or(Format::AnyRaw, Format::Raw))
}

fn network_source(_: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    Ok(Format::Any)
}

fn passthrough(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Any)
}

fn convert(input: Option<Format>, props: &Properties) -> std::result::Result<Format, String> {
    let input = expect(input, Format::AnyRaw)?;
    Ok(match pixel_format(props)? {
        Some(p) => Format::Raw(p),
        None if input == Format::Any => Format::AnyRaw,
        None => input,
    })
}

fn depay_h264(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Rtp(Codec::H264)).map(|_| Format::Encoded(Codec::H264))
}

fn depay_mp4v(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Rtp(Codec::Mp4v)).map(|_| Format::Encoded(Codec::Mp4v))
}

fn demux_flv(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Any).map(|_| Format::Encoded(Codec::H264))
}

fn parse_h264(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Encoded(Codec::H264)).map(|_| Format::Encoded(Codec::H264))
}

fn pay_h264(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Encoded(Codec::H264)).map(|_| Format::Rtp(Codec::H264))
}

fn decode_h264(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::Encoded(Codec::H264)).map(|_| Format::AnyRaw)
}

fn encode_h264(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::AnyRaw).map(|_| Format::Encoded(Codec::H264))
}

fn raw_sink(input: Option<Format>, _: &Properties) -> std::result::Result<Format, String> {
    expect(input, Format::AnyRaw)
}

static FACTORIES: &[Factory] = &[
    Factory {
        name: "testsrc",
        kind: StageKind::Source,
        properties: &[
            opt("num-buffers", PropType::Int),
            opt("width", PropType::Int),
            opt("height", PropType::Int),
            opt("format", PropType::Enum(PIXEL_FORMATS)),
            opt("framerate", PropType::Int),
            opt("is-live", PropType::Bool),
            opt("pattern", PropType::Enum(&["counter", "solid"])),
        ],
        app_port: None,
        negotiate: test_source,
    },
    Factory {
        name: "appsrc",
        kind: StageKind::Source,
        properties: &[
            opt("format", PropType::Enum(PIXEL_FORMATS)),
            opt("width", PropType::Int),
            opt("height", PropType::Int),
            opt("max-buffers", PropType::Int),
            opt("is-live", PropType::Bool),
        ],
        app_port: Some(AppPort::Source),
        negotiate: app_source,
    },
    Factory {
        name: "tcpclientsrc",
        kind: StageKind::Source,
        properties: &[req("host", PropType::Str), opt("port", PropType::Int)],
        app_port: None,
        negotiate: network_source,
    },
    Factory {
        name: "udpsrc",
        kind: StageKind::Source,
        properties: &[
            opt("uri", PropType::Str),
            opt("port", PropType::Int),
            opt("address", PropType::Str),
        ],
        app_port: None,
        negotiate: network_source,
    },
    Factory {
        name: "rtspsrc",
        kind: StageKind::Source,
        properties: &[
            req("location", PropType::Str),
            opt("latency", PropType::Int),
            opt("protocols", PropType::Enum(&["tcp", "udp", "udp-mcast"])),
        ],
        app_port: None,
        negotiate: network_source,
    },
    Factory {
        name: "rtmpsrc",
        kind: StageKind::Source,
        properties: &[req("location", PropType::Str)],
        app_port: None,
        negotiate: network_source,
    },
    Factory {
        name: "identity",
        kind: StageKind::Filter,
        properties: &[opt("silent", PropType::Bool), opt("error-after", PropType::Int)],
        app_port: None,
        negotiate: passthrough,
    },
    Factory {
        name: "videoconvert",
        kind: StageKind::Filter,
        properties: &[opt("format", PropType::Enum(PIXEL_FORMATS))],
        app_port: None,
        negotiate: convert,
    },
    Factory {
        name: "rtph264depay",
        kind: StageKind::Filter,
        properties: &[],
        app_port: None,
        negotiate: depay_h264,
    },
    Factory {
        name: "rtpmp4vdepay",
        kind: StageKind::Filter,
        properties: &[],
        app_port: None,
        negotiate: depay_mp4v,
    },
    Factory {
        name: "flvdemux",
        kind: StageKind::Filter,
        properties: &[],
        app_port: None,
        negotiate: demux_flv,
    },
    Factory {
        name: "h264parse",
        kind: StageKind::Filter,
        properties: &[opt("config-interval", PropType::Int)],
        app_port: None,
        negotiate: parse_h264,
    },
    Factory {
        name: "rtph264pay",
        kind: StageKind::Filter,
        properties: &[opt("pt", PropType::Int), opt("config-interval", PropType::Int)],
        app_port: None,
        negotiate: pay_h264,
    },
    Factory {
        name: "nullcodec",
        kind: StageKind::Codec,
        properties: &[],
        app_port: None,
        negotiate: passthrough,
    },
    Factory {
        name: "avdec_h264",
        kind: StageKind::Codec,
        properties: &[opt("max-threads", PropType::Int)],
        app_port: None,
        negotiate: decode_h264,
    },
    Factory {
        name: "x264enc",
        kind: StageKind::Codec,
        properties: &[
            opt("bitrate", PropType::Int),
            opt("tune", PropType::Enum(&["zerolatency", "fastdecode", "stillimage"])),
            opt("speed-preset", PropType::Enum(&["ultrafast", "superfast", "veryfast", "faster", "fast", "medium"])),
            opt("key-int-max", PropType::Int),
        ],
        app_port: None,
        negotiate: encode_h264,
    },
    Factory {
        name: "appsink",
        kind: StageKind::Sink,
        properties: &[
            opt("max-buffers", PropType::Int),
            opt("drop", PropType::Bool),
            opt("sync", PropType::Bool),
        ],
        app_port: Some(AppPort::Sink),
        negotiate: raw_sink,
    },
    Factory {
        name: "fakesink",
        kind: StageKind::Sink,
        properties: &[opt("sync", PropType::Bool)],
        app_port: None,
        negotiate: passthrough,
    },
    Factory {
        name: "udpsink",
        kind: StageKind::Sink,
        properties: &[opt("host", PropType::Str), opt("port", PropType::Int)],
        app_port: None,
        negotiate: passthrough,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_names_are_unique() {
        let mut names: Vec<_> = factories().iter().map(|f| f.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), factories().len());
    }

    #[test]
    fn missing_required_property() {
        let f = lookup("rtspsrc").unwrap();
        let err = f.check_properties("rtspsrc0", &Properties::new()).unwrap_err();
        assert!(err.to_string().contains("location"), "{err}");
    }

    #[test]
    fn unknown_property_is_rejected() {
        let f = lookup("testsrc").unwrap();
        let props = Properties::new().with("colour", PropertyValue::Enum("red".into()));
        assert!(f.check_properties("testsrc0", &props).is_err());
    }

    #[test]
    fn decoder_rejects_mpeg4_stream() {
        let depay = lookup("rtpmp4vdepay").unwrap();
        let dec = lookup("avdec_h264").unwrap();
        let out = depay.negotiate(Some(Format::Any), &Properties::new()).unwrap();
        assert_eq!(out, Format::Encoded(Codec::Mp4v));
        assert!(dec.negotiate(Some(out), &Properties::new()).is_err());
    }

    #[test]
    fn appsink_needs_raw_frames() {
        let sink = lookup("appsink").unwrap();
        assert!(
            sink.negotiate(Some(Format::Encoded(Codec::H264)), &Properties::new())
                .is_err()
        );
        assert!(sink.negotiate(Some(Format::Any), &Properties::new()).is_ok());
    }

    #[test]
    fn videoconvert_picks_requested_layout() {
        let conv = lookup("videoconvert").unwrap();
        let props = Properties::new().with("format", PropertyValue::Enum("bgra".into()));
        assert_eq!(
            conv.negotiate(Some(Format::Raw(PixelFormat::Rgb)), &props),
            Ok(Format::Raw(PixelFormat::Bgra))
        );
    }
}
