//! Frame source implementations
//!
//! - [`ResilientSource`]: a single upstream network stream with automatic
//!   reconnection and exponential backoff
//! - [`ChannelSource`]: frames pushed in by a peer connection
//! - [`FfmpegConnector`]: libavformat-backed connector (`ffmpeg` feature)

pub mod channel;
pub mod connector;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod resilient;

pub use channel::{ChannelSource, FrameSender, channel_source};
pub use connector::{StreamConnector, StreamHandle};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegConnector;
pub use resilient::{ReconnectPolicy, ResilientSource};
