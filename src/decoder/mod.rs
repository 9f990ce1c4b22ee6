// Video decoder module
// Hardware decoding with software fallback
//
// Decode paths:
// 1. Hardware accelerator (VAAPI through FFmpeg), frames stay in device memory
// 2. Software codec (FFmpeg, or OpenH264 for H.264), frames land in host memory

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(feature = "openh264")]
pub mod software;

#[cfg(test)]
pub(crate) mod mock;

use crate::capability::CapabilityDescriptor;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Compressed video codecs a camera can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[serde(alias = "h.264", alias = "avc")]
    H264,
    #[serde(alias = "h265", alias = "h.265")]
    Hevc,
}

impl CodecKind {
    pub const ALL: [CodecKind; 2] = [CodecKind::H264, CodecKind::Hevc];

    /// Decoder name understood by the native codec framework
    pub fn decoder_name(&self) -> &'static str {
        match self {
            CodecKind::H264 => "h264",
            CodecKind::Hevc => "hevc",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::H264 => f.write_str("H.264"),
            CodecKind::Hevc => f.write_str("HEVC"),
        }
    }
}

/// Which kind of decoder context is producing frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderPath {
    Hardware,
    Software,
}

impl fmt::Display for DecoderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderPath::Hardware => f.write_str("hardware"),
            DecoderPath::Software => f.write_str("software"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecoderError {
    #[error("Accelerator device not available")]
    DeviceUnavailable,
    #[error("Failed to initialize accelerator: {0}")]
    AcceleratorInit(String),
    #[error("Transient decode error: {0}")]
    Transient(String),
    #[error("Decoder context invalidated: {0}")]
    Structural(String),
    #[error("Codec {0} not supported")]
    UnsupportedCodec(CodecKind),
    #[error("Resources exhausted: {0}")]
    ResourceExhaustion(String),
}

/// How a session must react to a [`DecoderError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Hardware is not usable; decode on software instead
    Recoverable,
    /// One packet is lost; keep decoding
    Transient,
    /// The decoder context is gone; fall back once, fatal on software
    Structural,
    /// The session cannot continue on any path
    Fatal,
}

impl DecoderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DecoderError::DeviceUnavailable | DecoderError::AcceleratorInit(_) => {
                ErrorClass::Recoverable
            }
            DecoderError::Transient(_) => ErrorClass::Transient,
            DecoderError::Structural(_) => ErrorClass::Structural,
            DecoderError::UnsupportedCodec(_) | DecoderError::ResourceExhaustion(_) => {
                ErrorClass::Fatal
            }
        }
    }
}

/// One compressed access unit from a camera
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub data: Bytes,
    /// Presentation timestamp in milliseconds
    pub pts: i64,
    pub is_keyframe: bool,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, pts: i64, is_keyframe: bool) -> Self {
        Self {
            data: data.into(),
            pts,
            is_keyframe,
        }
    }
}

/// Pixel layouts decoders hand out before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPixelFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling
    Yuv420p,
    /// Y plane followed by interleaved UV plane
    Nv12,
    Bgra,
    Rgb24,
}

impl RawPixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            RawPixelFormat::Yuv420p => 3,
            RawPixelFormat::Nv12 => 2,
            RawPixelFormat::Bgra | RawPixelFormat::Rgb24 => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, stride: usize) -> Self {
        Self { data, stride }
    }
}

/// Frame pixels resident in host memory, in decoder-native layout
#[derive(Debug, Clone, PartialEq)]
pub struct HostImage {
    pub format: RawPixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

/// A decoded picture still owned by the accelerator.
///
/// The only way to reach its pixels is [`DeviceSurface::transfer_to_host`],
/// which performs the copy-out from device memory.
pub trait DeviceSurface: Send {
    fn transfer_to_host(&self) -> Result<HostImage, DecoderError>;
}

pub enum FrameMemory {
    Host(HostImage),
    Device(Box<dyn DeviceSurface>),
}

impl fmt::Debug for FrameMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameMemory::Host(image) => f
                .debug_struct("Host")
                .field("format", &image.format)
                .field("planes", &image.planes.len())
                .finish(),
            FrameMemory::Device(_) => f.write_str("Device"),
        }
    }
}

/// Decoder output before normalization
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in milliseconds
    pub pts: i64,
    pub memory: FrameMemory,
}

impl RawFrame {
    pub fn host(pts: i64, image: HostImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            pts,
            memory: FrameMemory::Host(image),
        }
    }

    pub fn device(width: u32, height: u32, pts: i64, surface: Box<dyn DeviceSurface>) -> Self {
        Self {
            width,
            height,
            pts,
            memory: FrameMemory::Device(surface),
        }
    }

    pub fn is_device_resident(&self) -> bool {
        matches!(self.memory, FrameMemory::Device(_))
    }
}

/// A live codec context on one decode path.
///
/// Codecs buffer: one `submit` may be followed by zero or several frames
/// from `drain`, possibly only after later packets arrive.
pub trait DecoderContext: Send {
    /// Feed one compressed packet
    fn submit(&mut self, packet: &Packet) -> Result<(), DecoderError>;

    /// Pull the next decoded frame, `None` when more input is needed
    fn drain(&mut self) -> Result<Option<RawFrame>, DecoderError>;

    /// Signal end of input so buffered frames become drainable
    fn flush(&mut self) -> Result<(), DecoderError>;

    /// Release the native context. Further calls are invalid.
    fn close(&mut self);

    /// Get decoder info
    fn info(&self) -> &str;
}

/// The one decoder context a session holds, tagged by path
pub enum ActiveDecoder {
    Hardware(Box<dyn DecoderContext>),
    Software(Box<dyn DecoderContext>),
}

impl ActiveDecoder {
    pub fn path(&self) -> DecoderPath {
        match self {
            ActiveDecoder::Hardware(_) => DecoderPath::Hardware,
            ActiveDecoder::Software(_) => DecoderPath::Software,
        }
    }

    pub fn context_mut(&mut self) -> &mut dyn DecoderContext {
        match self {
            ActiveDecoder::Hardware(ctx) | ActiveDecoder::Software(ctx) => ctx.as_mut(),
        }
    }

    pub fn info(&self) -> &str {
        match self {
            ActiveDecoder::Hardware(ctx) | ActiveDecoder::Software(ctx) => ctx.info(),
        }
    }

    /// Release the native context and consume the handle
    pub fn close(mut self) {
        self.context_mut().close();
    }
}

/// Factory for decoder contexts on either path
pub trait DecoderBackend: Send + Sync {
    /// Build a context on the accelerator described by `capability`
    fn open_hardware(
        &self,
        codec: CodecKind,
        capability: &CapabilityDescriptor,
    ) -> Result<Box<dyn DecoderContext>, DecoderError>;

    /// Build a host-memory software context
    fn open_software(&self, codec: CodecKind) -> Result<Box<dyn DecoderContext>, DecoderError>;

    fn name(&self) -> &str;
}

/// Decoders backed by the native libraries compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl DecoderBackend for NativeBackend {
    #[allow(unused_variables)]
    fn open_hardware(
        &self,
        codec: CodecKind,
        capability: &CapabilityDescriptor,
    ) -> Result<Box<dyn DecoderContext>, DecoderError> {
        crate::bootstrap::ensure_library_paths_configured();

        let device = capability
            .device_path
            .as_deref()
            .ok_or(DecoderError::DeviceUnavailable)?;

        #[cfg(all(feature = "ffmpeg", target_os = "linux"))]
        {
            if capability.accelerator == crate::capability::AcceleratorKind::Vaapi {
                let decoder = ffmpeg::vaapi::open(codec, device)?;
                log::info!("Using {} decoder for {}", decoder.info(), codec);
                return Ok(Box::new(decoder));
            }
        }

        log::debug!(
            "No hardware decoder for {:?} at {}",
            capability.accelerator,
            device.display()
        );
        Err(DecoderError::DeviceUnavailable)
    }

    fn open_software(&self, codec: CodecKind) -> Result<Box<dyn DecoderContext>, DecoderError> {
        crate::bootstrap::ensure_library_paths_configured();

        #[cfg(feature = "ffmpeg")]
        {
            match ffmpeg::FfmpegDecoder::software(codec) {
                Ok(dec) => {
                    log::info!("Using {} decoder for {}", dec.info(), codec);
                    return Ok(Box::new(dec));
                }
                Err(e) => log::warn!("FFmpeg software decoder not available: {}", e),
            }
        }

        #[cfg(feature = "openh264")]
        {
            if codec == CodecKind::H264 {
                let dec = software::SoftwareDecoder::new()?;
                log::info!("Using {} decoder for {}", dec.info(), codec);
                return Ok(Box::new(dec));
            }
        }

        Err(DecoderError::UnsupportedCodec(codec))
    }

    fn name(&self) -> &str {
        "native"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(DecoderError::DeviceUnavailable.class(), ErrorClass::Recoverable);
        assert_eq!(
            DecoderError::AcceleratorInit("busy".into()).class(),
            ErrorClass::Recoverable
        );
        assert_eq!(DecoderError::Transient("corrupt".into()).class(), ErrorClass::Transient);
        assert_eq!(DecoderError::Structural("lost".into()).class(), ErrorClass::Structural);
        assert_eq!(
            DecoderError::UnsupportedCodec(CodecKind::Hevc).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            DecoderError::ResourceExhaustion("oom".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_codec_kind_serde_aliases() {
        let codec: CodecKind = serde_json::from_str("\"h264\"").unwrap();
        assert_eq!(codec, CodecKind::H264);
        let codec: CodecKind = serde_json::from_str("\"h265\"").unwrap();
        assert_eq!(codec, CodecKind::Hevc);
        assert_eq!(CodecKind::Hevc.decoder_name(), "hevc");
        assert_eq!(CodecKind::H264.to_string(), "H.264");
    }

    #[test]
    fn test_native_backend_without_device() {
        let capability = CapabilityDescriptor::unavailable(None, "no device");
        let result = NativeBackend.open_hardware(CodecKind::H264, &capability);
        assert!(matches!(result, Err(DecoderError::DeviceUnavailable)));
    }
}
