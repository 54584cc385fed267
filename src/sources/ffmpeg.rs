//! FFmpeg-backed network stream connector (`ffmpeg` feature)

use std::collections::BTreeMap;
use std::sync::Once;

use anyhow::{Context, anyhow};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::connector::{StreamConnector, StreamHandle};
use crate::endpoint::{READ_TIMEOUT, StreamEndpoint};
use crate::source::StreamInfo;
use crate::{PipelineError, Result};

static INIT: Once = Once::new();

/// Opens RTSP/HTTP/file streams through libavformat
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegConnector;

impl FfmpegConnector {
    pub fn new() -> Self {
        INIT.call_once(|| {
            if let Err(e) = ffmpeg::init() {
                tracing::error!("FFmpeg initialisation failed: {}", e);
            }
            // Decoder chatter for lost packets is expected on IP cameras
            ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Fatal);
        });
        Self
    }
}

impl StreamConnector for FfmpegConnector {
    fn connect(&self, endpoint: &StreamEndpoint) -> Result<Box<dyn StreamHandle>> {
        FfmpegHandle::open(endpoint).map(|h| Box::new(h) as Box<dyn StreamHandle>).map_err(|e| {
            PipelineError::connection_failed(endpoint.url(), format!("{e:#}"))
        })
    }
}

/// Demuxer options for `endpoint`, always carrying a socket read timeout so a
/// silent camera cannot block a read forever
pub(crate) fn demuxer_options(endpoint: &StreamEndpoint) -> BTreeMap<String, String> {
    let mut options = endpoint.options().clone();
    if !options.contains_key("timeout") && !options.contains_key("rw_timeout") {
        let key = if endpoint.url().starts_with("rtsp") { "timeout" } else { "rw_timeout" };
        options.insert(key.to_string(), READ_TIMEOUT.as_micros().to_string());
    }
    options
}

struct FfmpegHandle {
    url: String,
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    info: StreamInfo,
}

// The FFmpeg contexts are only ever touched by one thread at a time, behind
// the source's connection lock.
unsafe impl Send for FfmpegHandle {}

impl FfmpegHandle {
    fn open(endpoint: &StreamEndpoint) -> anyhow::Result<Self> {
        let mut options = ffmpeg::Dictionary::new();
        for (key, value) in &demuxer_options(endpoint) {
            options.set(key, value);
        }

        let input = ffmpeg::format::input_with_dictionary(&endpoint.url(), options)
            .context("failed to open input")?;

        let stream =
            input.streams().best(ffmpeg::media::Type::Video).context("no video stream found")?;
        let stream_index = stream.index();
        let fps = {
            let rate = stream.avg_frame_rate();
            (rate.denominator() != 0).then(|| f64::from(rate))
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("failed to create codec context")?
            .decoder()
            .video()
            .context("failed to create video decoder")?;

        let (width, height) = (decoder.width(), decoder.height());
        if width == 0 || height == 0 {
            return Err(anyhow!("stream reports no frame size"));
        }

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("failed to create scaler")?;

        let codec = decoder.codec().map(|c| c.name().to_string()).unwrap_or_default();
        let info = StreamInfo { codec, width: Some(width), height: Some(height), fps };

        Ok(Self { url: endpoint.url().to_string(), input, decoder, scaler, stream_index, info })
    }
}

fn to_rgb_image(frame: &ffmpeg::frame::Video) -> Option<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(data.get(start..start + row_bytes)?);
    }
    RgbImage::from_raw(width, height, pixels)
}

impl StreamHandle for FfmpegHandle {
    fn info(&self) -> StreamInfo {
        self.info.clone()
    }

    fn read_frame(&mut self, cancel: &CancellationToken) -> Result<Option<RgbImage>> {
        let Self { url, input, decoder, scaler, stream_index, .. } = self;
        let mut decoded = ffmpeg::frame::Video::empty();

        // Packets are read one at a time: a timed-out read must surface as an
        // error instead of being retried inside the demuxer loop
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    debug!("Input reached end of stream");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(PipelineError::connection_failed(url, format!("read failed: {e}")));
                }
            }
            if packet.stream() != *stream_index {
                continue;
            }

            if let Err(e) = decoder.send_packet(&packet) {
                // Lost slices are routine on lossy links; the next keyframe recovers
                trace!("Dropping undecodable packet: {}", e);
                continue;
            }

            if decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb = ffmpeg::frame::Video::empty();
                scaler
                    .run(&decoded, &mut rgb)
                    .map_err(|e| PipelineError::decode_error(format!("scaling failed: {e}")))?;
                return to_rgb_image(&rgb)
                    .map(Some)
                    .ok_or_else(|| PipelineError::decode_error("short frame buffer"));
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        // Flush the decoder; the input context closes on drop
        let _ = self.decoder.send_eof();
        Ok(())
    }
}
