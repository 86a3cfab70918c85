//! Receive chains for source URLs.

use anyhow::{Context, bail};

/// Stages that end every receive chain, so frames reach the application as
/// packed RGB.
pub const TO_APP: &str = "videoconvert format=RGB ! appsink";

/// Description stages that decode `url` into raw frames.
///
/// | Scheme     | Chain                                                  |
/// |------------|--------------------------------------------------------|
/// | `test://`  | synthetic live source                                  |
/// | `tcp://`   | `tcpclientsrc` carrying an H.264 byte stream           |
/// | `udp://`   | `udpsrc` carrying an H.264 byte stream                 |
/// | `rtsp://`  | `rtspsrc` with RTP H.264 depayloading                  |
/// | `rtmp://`  | `rtmpsrc` with FLV demuxing                            |
pub fn receive_chain(url: &str) -> anyhow::Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .with_context(|| format!("'{url}' is not a URL"))?;

    let chain = match scheme.to_ascii_lowercase().as_str() {
        "test" => "testsrc is-live=true".to_string(),
        "tcp" => {
            let (host, port) = host_port(rest)?;
            format!("tcpclientsrc host={host} port={port} ! h264parse ! avdec_h264")
        }
        "udp" => {
            host_port(rest)?;
            format!("udpsrc uri={} ! h264parse ! avdec_h264", quote(url))
        }
        "rtsp" | "rtsps" => format!(
            "rtspsrc location={} latency=0 ! rtph264depay ! h264parse ! avdec_h264",
            quote(url)
        ),
        "rtmp" | "rtmps" => format!(
            "rtmpsrc location={} ! flvdemux ! h264parse ! avdec_h264",
            quote(url)
        ),
        other => bail!("unsupported scheme '{other}'"),
    };
    Ok(chain)
}

/// Description that takes injected RGB frames of the given size and sends
/// them to `url`.
///
/// | Scheme    | Chain                                                   |
/// |-----------|---------------------------------------------------------|
/// | `udp://`  | H.264 encode, RTP payloading, `udpsink`                 |
/// | `null://` | frames are discarded; exercises the injection path only |
pub fn send_chain(url: &str, width: u32, height: u32) -> anyhow::Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .with_context(|| format!("'{url}' is not a URL"))?;
    let source = format!("appsrc format=RGB width={width} height={height} is-live=true");

    let chain = match scheme.to_ascii_lowercase().as_str() {
        "udp" => {
            let (host, port) = host_port(rest)?;
            format!(
                "{source} ! videoconvert ! x264enc tune=zerolatency speed-preset=ultrafast \
                 ! rtph264pay pt=96 config-interval=1 ! udpsink host={} port={port}",
                quote(host)
            )
        }
        "null" => format!("{source} ! fakesink"),
        other => bail!("cannot send to scheme '{other}'"),
    };
    Ok(chain)
}

fn host_port(authority: &str) -> anyhow::Result<(&str, u16)> {
    let authority = authority.split('/').next().unwrap_or(authority);
    let (host, port) = authority
        .rsplit_once(':')
        .with_context(|| format!("'{authority}' has no port"))?;
    let port = port
        .parse()
        .with_context(|| format!("'{port}' is not a port number"))?;
    if host.is_empty() {
        bail!("'{authority}' has no host");
    }
    Ok((host, port))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use relay::Description;

    use super::*;

    fn full(url: &str) -> Description {
        let text = format!("{} ! {TO_APP}", receive_chain(url).unwrap());
        text.parse().unwrap()
    }

    #[test]
    fn tcp_source() {
        let d = full("tcp://192.168.1.10:5000");
        assert_eq!(d.stages[0].factory, "tcpclientsrc");
        assert_eq!(d.stages[0].properties.str("host"), Some("192.168.1.10"));
        assert_eq!(d.stages[0].properties.int("port"), Some(5000));
        assert_eq!(d.stages.last().unwrap().factory, "appsink");
    }

    #[test]
    fn rtsp_location_survives_quoting() {
        let d = full("rtsp://10.0.0.2:554/stream?user=a");
        assert_eq!(d.stages[0].factory, "rtspsrc");
        assert_eq!(
            d.stages[0].properties.str("location"),
            Some("rtsp://10.0.0.2:554/stream?user=a")
        );
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(receive_chain("file:///tmp/x").is_err());
        assert!(receive_chain("tcp://nohost").is_err());
        assert!(receive_chain("udp://:5000").is_err());
        assert!(receive_chain("no-scheme").is_err());
    }

    #[test]
    fn udp_send_chain_encodes_and_pays() {
        let d: Description = send_chain("udp://127.0.0.1:5004", 320, 240)
            .unwrap()
            .parse()
            .unwrap();
        let factories: Vec<_> = d.stages.iter().map(|s| s.factory.as_str()).collect();
        assert_eq!(
            factories,
            ["appsrc", "videoconvert", "x264enc", "rtph264pay", "udpsink"]
        );
        assert_eq!(d.stages[0].properties.int("width"), Some(320));
        assert_eq!(d.stages[4].properties.str("host"), Some("127.0.0.1"));
        assert_eq!(d.stages[4].properties.int("port"), Some(5004));

        assert!(send_chain("rtsp://h:1/x", 8, 8).is_err());
        assert!(send_chain("udp://nohost", 8, 8).is_err());
    }

    #[test]
    fn test_source_runs_locally() {
        let engine = relay::LocalEngine::new();
        let text = format!("{} ! {TO_APP}", receive_chain("test://").unwrap());
        let graph =
            relay::PipelineGraph::from_description(&engine, &text, relay::GraphConfig::default())
                .unwrap();
        graph.teardown();
    }
}
