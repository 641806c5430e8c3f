pub mod bridge;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod fanout;
pub mod media;
pub mod mount;
pub mod orchestrator;
pub mod producer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::{BridgeStats, FrameBridge, FrameBuffer, FrameConsumer, FrameSink};
pub use config::{CameraConfig, ServerConfig};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, RunState, StopHandle, WakeupToken};
pub use media::Packetizer;
pub use orchestrator::CameraServer;
pub use producer::{FrameFeeder, FrameProducer, PushProducer, SyntheticProducer};
pub use server::{RtspServer, Viewer};
