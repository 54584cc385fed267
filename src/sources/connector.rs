//! Blocking stream connector abstraction
//!
//! A connector opens one live connection to an endpoint; the returned handle
//! demuxes and decodes frames. Both operations block the calling thread and
//! are only ever invoked from the blocking thread pool.

use image::RgbImage;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::endpoint::StreamEndpoint;
use crate::source::StreamInfo;

/// Opens connections to a stream endpoint
pub trait StreamConnector: Send + Sync + 'static {
    /// Establish a new connection.
    ///
    /// Errors should be `PipelineError::Connection`, built with
    /// `PipelineError::connection_failed` so the endpoint is masked.
    fn connect(&self, endpoint: &StreamEndpoint) -> Result<Box<dyn StreamHandle>>;
}

/// One live, decoding connection
pub trait StreamHandle: Send + 'static {
    /// Codec and geometry of the video stream
    fn info(&self) -> StreamInfo;

    /// Demux and decode until the next video frame (blocking).
    ///
    /// Returns:
    /// - `Ok(Some(image))` - next decoded frame
    /// - `Ok(None)` - the upstream reached end of stream
    /// - `Err(e)` - demux or decode failure
    ///
    /// Implementations check `cancel` between packets and return `Ok(None)`
    /// promptly once it fires.
    fn read_frame(&mut self, cancel: &CancellationToken) -> Result<Option<RgbImage>>;

    /// Release the connection. Called exactly once before the handle drops.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
