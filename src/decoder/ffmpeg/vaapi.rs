// Linux VAAPI hardware decoder
// Works with Intel, AMD, and some NVIDIA GPUs
//
// FFmpeg drives libva: the codec context gets a VAAPI device and its
// default get_format picks the VAAPI surface format, so decoded frames stay
// on the GPU until the normalizer asks for them.

use super::{FfmpegDecoder, classify, host_image, init_ffmpeg, scale_to_rgb24};
use crate::decoder::{
    CodecKind, DecoderError, DecoderPath, DeviceSurface, HostImage, RawPixelFormat,
};
use ffmpeg::ffi;
use ffmpeg::format::Pixel;
use ffmpeg::frame::Video as VideoFrame;
use ffmpeg_next as ffmpeg;
use std::ffi::CString;
use std::path::Path;
use std::ptr;

/// Owned reference to an FFmpeg VAAPI device context
struct HwDevice {
    buffer: *mut ffi::AVBufferRef,
}

impl HwDevice {
    fn open(device: &Path) -> Result<Self, DecoderError> {
        let path = device
            .to_str()
            .and_then(|p| CString::new(p).ok())
            .ok_or_else(|| {
                DecoderError::AcceleratorInit(format!("Invalid device path {}", device.display()))
            })?;

        let mut buffer: *mut ffi::AVBufferRef = ptr::null_mut();
        // SAFETY: `buffer` is a valid out-pointer and `path` outlives the call.
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut buffer,
                ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
                path.as_ptr(),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || buffer.is_null() {
            return Err(DecoderError::AcceleratorInit(format!(
                "Failed to open VAAPI device {}: {}",
                device.display(),
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(Self { buffer })
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        // SAFETY: `buffer` came from av_hwdevice_ctx_create and is unreferenced once.
        unsafe { ffi::av_buffer_unref(&mut self.buffer) };
    }
}

/// Whether FFmpeg's decoder can output VAAPI surfaces through a device context
fn supports_vaapi(codec: *const ffi::AVCodec) -> bool {
    for index in 0.. {
        // SAFETY: `codec` points at a registered codec; FFmpeg returns null
        // past the last hardware configuration.
        let config = unsafe { ffi::avcodec_get_hw_config(codec, index) };
        if config.is_null() {
            return false;
        }
        // SAFETY: non-null configs are static tables owned by FFmpeg.
        let config = unsafe { &*config };
        let device_ctx = config.methods as u32
            & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32
            != 0;
        if config.device_type == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI && device_ctx {
            return true;
        }
    }
    false
}

/// Check a decoder before touching the device
fn ensure_vaapi(codec: CodecKind, decoder: *const ffi::AVCodec) -> Result<(), DecoderError> {
    if supports_vaapi(decoder) {
        Ok(())
    } else {
        Err(DecoderError::AcceleratorInit(format!(
            "FFmpeg {} decoder has no VAAPI support",
            codec
        )))
    }
}

fn missing_decoder(codec: CodecKind) -> DecoderError {
    DecoderError::AcceleratorInit(format!("No {} decoder in FFmpeg", codec))
}

/// Open a VAAPI decoder for `codec` on the render node at `device`
pub fn open(codec: CodecKind, device: &Path) -> Result<FfmpegDecoder, DecoderError> {
    init_ffmpeg()?;

    let found =
        ffmpeg::decoder::find_by_name(codec.decoder_name()).ok_or_else(|| missing_decoder(codec))?;
    // SAFETY: pointer to a codec owned by FFmpeg for the process lifetime.
    ensure_vaapi(codec, unsafe { found.as_ptr() })?;
    let hw_device = HwDevice::open(device)?;

    let mut context = ffmpeg::codec::context::Context::new_with_codec(found);
    // SAFETY: the context is not opened yet; it takes its own reference to
    // the device, released when the context is freed.
    unsafe {
        let device_ref = ffi::av_buffer_ref(hw_device.buffer);
        if device_ref.is_null() {
            return Err(DecoderError::ResourceExhaustion(
                "Failed to reference VAAPI device".to_string(),
            ));
        }
        (*context.as_mut_ptr()).hw_device_ctx = device_ref;
    }

    let decoder = context.decoder().video().map_err(|e| {
        DecoderError::AcceleratorInit(format!("Failed to open {} VAAPI decoder: {}", codec, e))
    })?;

    log::info!("VAAPI device {} opened for {}", device.display(), codec);

    Ok(FfmpegDecoder::from_opened(
        decoder,
        codec,
        DecoderPath::Hardware,
        format!("VAAPI {} (Hardware)", codec.decoder_name()),
    ))
}

/// List the codecs that can be decoded on `device`.
///
/// Opening the device proves the driver loads; codec support comes from
/// FFmpeg's hardware configurations for each decoder.
pub fn probe_codecs(device: &Path) -> Result<Vec<CodecKind>, DecoderError> {
    init_ffmpeg()?;
    let _device = HwDevice::open(device)?;

    let codecs: Vec<CodecKind> = CodecKind::ALL
        .into_iter()
        .filter(|&codec| {
            let checked = match ffmpeg::decoder::find_by_name(codec.decoder_name()) {
                // SAFETY: pointer to a codec owned by FFmpeg for the process lifetime.
                Some(found) => ensure_vaapi(codec, unsafe { found.as_ptr() }),
                None => Err(missing_decoder(codec)),
            };
            if let Err(e) = &checked {
                log::debug!("{}", e);
            }
            checked.is_ok()
        })
        .collect();
    Ok(codecs)
}

/// A decoded picture in a VAAPI surface
pub struct VaapiSurface {
    frame: VideoFrame,
}

impl VaapiSurface {
    pub(super) fn new(frame: VideoFrame) -> Self {
        Self { frame }
    }
}

impl DeviceSurface for VaapiSurface {
    fn transfer_to_host(&self) -> Result<HostImage, DecoderError> {
        let mut host = VideoFrame::empty();
        // SAFETY: both frames are valid; FFmpeg allocates `host` in the
        // surface's software format.
        let ret = unsafe { ffi::av_hwframe_transfer_data(host.as_mut_ptr(), self.frame.as_ptr(), 0) };
        if ret < 0 {
            return Err(classify(ffmpeg::Error::from(ret), "Surface transfer failed"));
        }

        match host.format() {
            Pixel::NV12 => host_image(&host, RawPixelFormat::Nv12),
            Pixel::YUV420P => host_image(&host, RawPixelFormat::Yuv420p),
            other => {
                log::debug!("VAAPI surface downloaded as {:?}, converting", other);
                host_image(&scale_to_rgb24(&host)?, RawPixelFormat::Rgb24)
            }
        }
    }
}
