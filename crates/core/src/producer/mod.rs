//! Encoded-frame producers.
//!
//! A producer owns the capture/encode pipeline for one camera and runs it on
//! its own thread. The only thing it knows about the rest of the system is
//! the [`FrameSink`] it receives in [`FrameProducer::start`]: every complete
//! access unit (Annex B byte stream) is handed over with
//! [`FrameSink::on_encoded_frame`].
//!
//! | Producer | Thread | Use |
//! |----------|--------|-----|
//! | [`SyntheticProducer`] | own, paced at `fps` | test pattern, demos |
//! | [`PushProducer`] | caller's | plugging in an external encoder |

pub mod push;
pub mod synthetic;

pub use crate::bridge::FrameSink;
pub use push::{FrameFeeder, PushProducer};
pub use synthetic::SyntheticProducer;

use crate::config::CameraConfig;
use crate::error::Result;

/// Source of encoded frames for one camera.
pub trait FrameProducer: Send {
    /// Configuration of the camera this producer encodes.
    fn camera(&self) -> &CameraConfig;

    /// Register `sink` as the frame callback and start producing.
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Stop producing. After this returns no further frames reach the sink.
    /// Must be idempotent.
    fn stop(&mut self);
}
