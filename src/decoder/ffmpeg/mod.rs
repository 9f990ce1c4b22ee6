//! FFmpeg-based video decoders
//!
//! Supports:
//! - Software decoding of H.264 and HEVC (frames in host memory)
//! - VAAPI hardware decoding on Linux (frames stay on the GPU, see [`vaapi`])

#[cfg(target_os = "linux")]
pub mod vaapi;

use super::{
    CodecKind, DecoderContext, DecoderError, DecoderPath, HostImage, Packet, Plane, RawFrame,
    RawPixelFormat,
};
use ffmpeg::format::Pixel;
use ffmpeg::frame::Video as VideoFrame;
use ffmpeg_next as ffmpeg;
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::io::ErrorKind;

static FFMPEG_INIT: OnceCell<Result<(), String>> = OnceCell::new();

/// Initialize FFmpeg (runs once, later calls return the first result)
pub(crate) fn init_ffmpeg() -> Result<(), DecoderError> {
    FFMPEG_INIT
        .get_or_init(|| {
            ffmpeg::init().map_err(|e| e.to_string())?;
            // Enable verbose logging in debug builds
            if cfg!(debug_assertions) {
                ffmpeg::log::set_level(ffmpeg::log::Level::Info);
            } else {
                ffmpeg::log::set_level(ffmpeg::log::Level::Error);
            }
            Ok(())
        })
        .clone()
        .map_err(|e| DecoderError::AcceleratorInit(format!("Failed to initialize FFmpeg: {}", e)))
}

fn errno_kind(error: &ffmpeg::Error) -> Option<ErrorKind> {
    match error {
        ffmpeg::Error::Other { errno } => Some(std::io::Error::from_raw_os_error(*errno).kind()),
        _ => None,
    }
}

/// EAGAIN: the codec wants the other side of the send/receive API first
fn is_again(error: &ffmpeg::Error) -> bool {
    errno_kind(error) == Some(ErrorKind::WouldBlock)
}

/// Map an FFmpeg error onto the decode error taxonomy
pub(crate) fn classify(error: ffmpeg::Error, what: &str) -> DecoderError {
    let message = format!("{}: {}", what, error);
    match error {
        ffmpeg::Error::InvalidData | ffmpeg::Error::PatchWelcome => DecoderError::Transient(message),
        ffmpeg::Error::DecoderNotFound => DecoderError::Structural(message),
        _ => match errno_kind(&error) {
            Some(ErrorKind::OutOfMemory) => DecoderError::ResourceExhaustion(message),
            Some(ErrorKind::InvalidInput) | Some(ErrorKind::InvalidData) => {
                DecoderError::Transient(message)
            }
            _ => DecoderError::Structural(message),
        },
    }
}

/// FFmpeg decoder context on either decode path
pub struct FfmpegDecoder {
    decoder: Option<ffmpeg::decoder::Video>,
    codec: CodecKind,
    path: DecoderPath,
    pending: VecDeque<RawFrame>,
    last_pts: i64,
    frame_count: u64,
    label: String,
}

impl FfmpegDecoder {
    /// Open a host-memory decoder for `codec`
    pub fn software(codec: CodecKind) -> Result<Self, DecoderError> {
        init_ffmpeg()?;

        let found = ffmpeg::decoder::find_by_name(codec.decoder_name())
            .ok_or(DecoderError::UnsupportedCodec(codec))?;

        let context = ffmpeg::codec::context::Context::new_with_codec(found);
        let decoder = context.decoder().video().map_err(|e| {
            DecoderError::AcceleratorInit(format!("Failed to open {} decoder: {}", codec, e))
        })?;

        Ok(Self::from_opened(
            decoder,
            codec,
            DecoderPath::Software,
            format!("FFmpeg {} (Software)", codec.decoder_name()),
        ))
    }

    pub(crate) fn from_opened(
        decoder: ffmpeg::decoder::Video,
        codec: CodecKind,
        path: DecoderPath,
        label: String,
    ) -> Self {
        log::info!("FFmpeg decoder initialized: {}", label);
        Self {
            decoder: Some(decoder),
            codec,
            path,
            pending: VecDeque::new(),
            last_pts: 0,
            frame_count: 0,
            label,
        }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn path(&self) -> DecoderPath {
        self.path
    }

    fn opened(&mut self) -> Result<&mut ffmpeg::decoder::Video, DecoderError> {
        self.decoder
            .as_mut()
            .ok_or_else(|| DecoderError::Structural("Decoder already closed".to_string()))
    }

    fn receive(&mut self) -> Result<Option<RawFrame>, DecoderError> {
        let mut frame = VideoFrame::empty();
        match self.opened()?.receive_frame(&mut frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(e) if is_again(&e) => return Ok(None),
            Err(e) => return Err(classify(e, "Receive frame failed")),
        }

        self.frame_count += 1;
        let pts = frame.pts().unwrap_or(self.last_pts);
        convert(frame, pts).map(Some)
    }

    // Decoded output is full; park it so the codec accepts input again
    fn park_output(&mut self) -> Result<(), DecoderError> {
        while let Some(frame) = self.receive()? {
            self.pending.push_back(frame);
        }
        Ok(())
    }
}

impl DecoderContext for FfmpegDecoder {
    fn submit(&mut self, packet: &Packet) -> Result<(), DecoderError> {
        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_pts(Some(packet.pts));
        if packet.is_keyframe {
            av_packet.set_flags(ffmpeg::codec::packet::Flags::KEY);
        }
        self.last_pts = packet.pts;

        match self.opened()?.send_packet(&av_packet) {
            Ok(()) => Ok(()),
            Err(e) if is_again(&e) => {
                self.park_output()?;
                self.opened()?
                    .send_packet(&av_packet)
                    .map_err(|e| classify(e, "Send packet failed"))
            }
            Err(e) => Err(classify(e, "Send packet failed")),
        }
    }

    fn drain(&mut self) -> Result<Option<RawFrame>, DecoderError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        self.receive()
    }

    fn flush(&mut self) -> Result<(), DecoderError> {
        match self.opened()?.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(classify(e, "Flush failed")),
        }
    }

    fn close(&mut self) {
        if self.decoder.take().is_some() {
            log::debug!("{} closed after {} frames", self.label, self.frame_count);
        }
        self.pending.clear();
    }

    fn info(&self) -> &str {
        &self.label
    }
}

fn convert(frame: VideoFrame, pts: i64) -> Result<RawFrame, DecoderError> {
    let format = match frame.format() {
        #[cfg(target_os = "linux")]
        Pixel::VAAPI => {
            let (width, height) = (frame.width(), frame.height());
            return Ok(RawFrame::device(
                width,
                height,
                pts,
                Box::new(vaapi::VaapiSurface::new(frame)),
            ));
        }
        Pixel::YUV420P | Pixel::YUVJ420P => RawPixelFormat::Yuv420p,
        Pixel::NV12 => RawPixelFormat::Nv12,
        Pixel::BGRA => RawPixelFormat::Bgra,
        Pixel::RGB24 => RawPixelFormat::Rgb24,
        other => {
            log::debug!("Converting {:?} frame with swscale", other);
            let rgb = scale_to_rgb24(&frame)?;
            return Ok(RawFrame::host(pts, host_image(&rgb, RawPixelFormat::Rgb24)?));
        }
    };
    Ok(RawFrame::host(pts, host_image(&frame, format)?))
}

/// Copy the planes of a host-resident frame
pub(crate) fn host_image(
    frame: &VideoFrame,
    format: RawPixelFormat,
) -> Result<HostImage, DecoderError> {
    let height = frame.height() as usize;
    let mut planes = Vec::with_capacity(format.plane_count());

    for index in 0..format.plane_count() {
        let rows = match (format, index) {
            (RawPixelFormat::Yuv420p | RawPixelFormat::Nv12, 1..) => height.div_ceil(2),
            _ => height,
        };
        let stride = frame.stride(index);
        let data = frame.data(index);
        let bytes = data.get(..stride * rows).ok_or_else(|| {
            DecoderError::Transient(format!(
                "Plane {} too short: {} bytes for {} rows of {}",
                index,
                data.len(),
                rows,
                stride
            ))
        })?;
        planes.push(Plane::new(bytes.to_vec(), stride));
    }

    Ok(HostImage {
        format,
        width: frame.width(),
        height: frame.height(),
        planes,
    })
}

/// Convert an uncommon pixel layout to RGB24 with swscale
pub(crate) fn scale_to_rgb24(frame: &VideoFrame) -> Result<VideoFrame, DecoderError> {
    let mut scaler = ffmpeg::software::scaling::context::Context::get(
        frame.format(),
        frame.width(),
        frame.height(),
        Pixel::RGB24,
        frame.width(),
        frame.height(),
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )
    .map_err(|e| DecoderError::Transient(format!("Failed to create scaler: {}", e)))?;

    let mut rgb = VideoFrame::empty();
    scaler
        .run(frame, &mut rgb)
        .map_err(|e| DecoderError::Transient(format!("Failed to scale frame: {}", e)))?;
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify(ffmpeg::Error::InvalidData, "decode"),
            DecoderError::Transient(_)
        ));
        assert!(matches!(
            classify(ffmpeg::Error::Bug, "decode"),
            DecoderError::Structural(_)
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_classify_errno() {
        // EAGAIN, ENOMEM, EIO
        assert!(is_again(&ffmpeg::Error::Other { errno: 11 }));
        assert!(matches!(
            classify(ffmpeg::Error::Other { errno: 12 }, "alloc"),
            DecoderError::ResourceExhaustion(_)
        ));
        assert!(matches!(
            classify(ffmpeg::Error::Other { errno: 5 }, "device"),
            DecoderError::Structural(_)
        ));
    }

    #[test]
    fn test_software_decoder_opens() {
        let mut decoder = FfmpegDecoder::software(CodecKind::H264).unwrap();
        assert_eq!(decoder.path(), DecoderPath::Software);
        assert!(decoder.drain().unwrap().is_none());
        decoder.close();
        assert!(matches!(
            decoder.submit(&Packet::new(vec![0, 0, 0, 1, 0x65], 0, true)),
            Err(DecoderError::Structural(_))
        ));
    }
}
