//! GStreamer engine for streamrelay graphs.
//!
//! Runs the stage catalog on real GStreamer elements. Each graph becomes a
//! `gst::Pipeline`; `appsink` samples and `appsrc` buffers are bridged to
//! the core's frame queues, and the pipeline bus is mapped onto the graph's
//! notifications.
//!
//! ## Usage
//!
//! ```no_run
//! use relay::{GraphConfig, PipelineGraph, State};
//! use relay_gst::GstEngine;
//!
//! let engine = GstEngine::new()?;
//! let graph = PipelineGraph::from_description(
//!     &engine,
//!     "rtspsrc location=rtsp://10.0.0.2:554/stream ! rtph264depay ! h264parse ! avdec_h264 ! videoconvert format=RGB ! appsink",
//!     GraphConfig::default(),
//! )?;
//! graph.set_state(State::Playing)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Stage mapping
//!
//! | Stage       | GStreamer element                     |
//! |-------------|---------------------------------------|
//! | `testsrc`   | `videotestsrc` + `capsfilter`         |
//! | `nullcodec` | `identity`                            |
//! | `appsrc`    | `appsrc` fed from the injection queue |
//! | `appsink`   | `appsink` feeding the pull queue      |
//! | others      | element of the same name              |

mod driver;
mod element;

use relay::{Bus, Driver, Element, Engine, Factory, Ports, Properties, RelayError, Stage};

use crate::element::GstElement;

/// Engine backed by the system GStreamer installation.
pub struct GstEngine {
    _private: (),
}

impl GstEngine {
    /// Initialise GStreamer. Safe to call more than once.
    pub fn new() -> relay::Result<Self> {
        gst::init().map_err(|e| RelayError::Engine {
            stage: None,
            message: format!("GStreamer failed to initialise: {e}"),
        })?;
        tracing::debug!(version = %gst::version_string(), "GStreamer initialised");
        Ok(Self { _private: () })
    }
}

/// GStreamer element that implements a catalog factory.
pub(crate) fn element_name(factory: &str) -> &str {
    match factory {
        "testsrc" => "videotestsrc",
        "nullcodec" => "identity",
        other => other,
    }
}

impl Engine for GstEngine {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn supports(&self, factory: &Factory) -> bool {
        gst::ElementFactory::find(element_name(factory.name)).is_some()
    }

    fn make_element(
        &self,
        stage: &str,
        factory: &'static Factory,
        properties: &Properties,
    ) -> relay::Result<Box<dyn Element>> {
        let mut element = GstElement::new(stage, factory)?;
        for (name, value) in properties.iter() {
            element.set_property(name, value)?;
        }
        Ok(Box::new(element))
    }

    fn assemble(&self, stages: &[Stage], ports: Ports, bus: Bus) -> relay::Result<Box<dyn Driver>> {
        Ok(Box::new(driver::GstDriver::assemble(stages, ports, bus)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_stages_map_to_gstreamer_elements() {
        assert_eq!(element_name("testsrc"), "videotestsrc");
        assert_eq!(element_name("nullcodec"), "identity");
        assert_eq!(element_name("rtph264depay"), "rtph264depay");
    }

    #[test]
    fn every_catalog_factory_has_an_element_name() {
        for factory in relay::catalog::factories() {
            assert!(!element_name(factory.name).is_empty());
        }
    }
}
