//! Scripted decoders and accelerator probe for tests

use super::{
    CodecKind, DecoderBackend, DecoderContext, DecoderError, DeviceSurface, HostImage, Packet,
    Plane, RawFrame, RawPixelFormat,
};
use crate::capability::{AcceleratorKind, AcceleratorProbe, CapabilityDescriptor};
use std::collections::VecDeque;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const FRAME_WIDTH: u32 = 16;
pub const FRAME_HEIGHT: u32 = 8;

/// Accelerator probe that counts how often it is asked
pub struct MockProbe {
    result: Result<Vec<CodecKind>, DecoderError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockProbe {
    pub fn supporting(codecs: Vec<CodecKind>) -> Self {
        Self {
            result: Ok(codecs),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: DecoderError) -> Self {
        Self {
            result: Err(error),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AcceleratorProbe for MockProbe {
    fn kind(&self) -> AcceleratorKind {
        AcceleratorKind::Vaapi
    }

    fn supported_codecs(&self, _device: &Path) -> Result<Vec<CodecKind>, DecoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.result.clone()
    }
}

/// Behaviour of one decode path
#[derive(Debug, Clone)]
pub struct PathScript {
    codecs: Vec<CodecKind>,
    init_error: Option<DecoderError>,
    /// Errors keyed by submit index within one context
    errors: Vec<(Range<usize>, DecoderError)>,
    /// Frames held back until this many later packets arrive
    buffering: usize,
}

impl PathScript {
    pub fn supporting(codecs: Vec<CodecKind>) -> Self {
        Self {
            codecs,
            init_error: None,
            errors: Vec::new(),
            buffering: 0,
        }
    }

    pub fn unsupported() -> Self {
        Self::supporting(Vec::new())
    }

    pub fn fail_init(mut self, error: DecoderError) -> Self {
        self.init_error = Some(error);
        self
    }

    pub fn error_at(mut self, index: usize, error: DecoderError) -> Self {
        self.errors.push((index..index + 1, error));
        self
    }

    pub fn error_in(mut self, indices: Range<usize>, error: DecoderError) -> Self {
        self.errors.push((indices, error));
        self
    }

    pub fn error_from(mut self, index: usize, error: DecoderError) -> Self {
        self.errors.push((index..usize::MAX, error));
        self
    }

    pub fn with_buffering(mut self, depth: usize) -> Self {
        self.buffering = depth;
        self
    }

    fn error_for(&self, index: usize) -> Option<DecoderError> {
        self.errors
            .iter()
            .find(|(range, _)| range.contains(&index))
            .map(|(_, error)| error.clone())
    }
}

#[derive(Debug, Default)]
pub struct BackendStats {
    pub hardware_opens: AtomicUsize,
    pub software_opens: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub closes: AtomicUsize,
    pub transfers: Arc<AtomicUsize>,
}

/// Backend whose contexts follow a [`PathScript`] per path
pub struct MockBackend {
    hardware: PathScript,
    software: PathScript,
    stats: Arc<BackendStats>,
}

impl MockBackend {
    pub fn new(hardware: PathScript, software: PathScript) -> Self {
        Self {
            hardware,
            software,
            stats: Arc::new(BackendStats::default()),
        }
    }

    /// Both paths decode every codec
    pub fn healthy() -> Self {
        Self::new(
            PathScript::supporting(CodecKind::ALL.to_vec()),
            PathScript::supporting(CodecKind::ALL.to_vec()),
        )
    }

    pub fn hardware_opens(&self) -> usize {
        self.stats.hardware_opens.load(Ordering::SeqCst)
    }

    pub fn software_opens(&self) -> usize {
        self.stats.software_opens.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }

    pub fn max_live_contexts(&self) -> usize {
        self.stats.max_live.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> usize {
        self.stats.transfers.load(Ordering::SeqCst)
    }

    fn open(
        &self,
        script: &PathScript,
        codec: CodecKind,
        device: bool,
        unsupported: DecoderError,
    ) -> Result<Box<dyn DecoderContext>, DecoderError> {
        if let Some(error) = &script.init_error {
            return Err(error.clone());
        }
        if !script.codecs.contains(&codec) {
            return Err(unsupported);
        }

        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockDecoder {
            script: script.clone(),
            device,
            stats: self.stats.clone(),
            submitted: 0,
            pending: VecDeque::new(),
            seen_keyframe: false,
            flushed: false,
            closed: false,
        }))
    }
}

impl DecoderBackend for MockBackend {
    fn open_hardware(
        &self,
        codec: CodecKind,
        _capability: &CapabilityDescriptor,
    ) -> Result<Box<dyn DecoderContext>, DecoderError> {
        self.stats.hardware_opens.fetch_add(1, Ordering::SeqCst);
        self.open(
            &self.hardware,
            codec,
            true,
            DecoderError::AcceleratorInit(format!("{} not supported by accelerator", codec)),
        )
    }

    fn open_software(&self, codec: CodecKind) -> Result<Box<dyn DecoderContext>, DecoderError> {
        self.stats.software_opens.fetch_add(1, Ordering::SeqCst);
        self.open(
            &self.software,
            codec,
            false,
            DecoderError::UnsupportedCodec(codec),
        )
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Decoder producing one gray frame per packet once a keyframe was seen
struct MockDecoder {
    script: PathScript,
    device: bool,
    stats: Arc<BackendStats>,
    submitted: usize,
    pending: VecDeque<i64>,
    seen_keyframe: bool,
    flushed: bool,
    closed: bool,
}

impl DecoderContext for MockDecoder {
    fn submit(&mut self, packet: &Packet) -> Result<(), DecoderError> {
        let index = self.submitted;
        self.submitted += 1;
        if let Some(error) = self.script.error_for(index) {
            return Err(error);
        }
        self.seen_keyframe |= packet.is_keyframe;
        if self.seen_keyframe {
            self.pending.push_back(packet.pts);
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<Option<RawFrame>, DecoderError> {
        if self.pending.len() <= self.script.buffering && !self.flushed {
            return Ok(None);
        }
        let Some(pts) = self.pending.pop_front() else {
            return Ok(None);
        };
        Ok(Some(if self.device {
            RawFrame::device(
                FRAME_WIDTH,
                FRAME_HEIGHT,
                pts,
                Box::new(MockSurface {
                    transfers: self.stats.transfers.clone(),
                }),
            )
        } else {
            RawFrame::host(pts, gray_image())
        }))
    }

    fn flush(&mut self) -> Result<(), DecoderError> {
        self.flushed = true;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn info(&self) -> &str {
        if self.device {
            "Mock (Hardware)"
        } else {
            "Mock (Software)"
        }
    }
}

impl Drop for MockDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

struct MockSurface {
    transfers: Arc<AtomicUsize>,
}

impl DeviceSurface for MockSurface {
    fn transfer_to_host(&self) -> Result<HostImage, DecoderError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(gray_image())
    }
}

/// Mid-gray yuv420p picture (Y=U=V=128)
pub fn gray_image() -> HostImage {
    let (w, h) = (FRAME_WIDTH as usize, FRAME_HEIGHT as usize);
    HostImage {
        format: RawPixelFormat::Yuv420p,
        width: FRAME_WIDTH,
        height: FRAME_HEIGHT,
        planes: vec![
            Plane::new(vec![128; w * h], w),
            Plane::new(vec![128; (w / 2) * (h / 2)], w / 2),
            Plane::new(vec![128; (w / 2) * (h / 2)], w / 2),
        ],
    }
}

/// Packets of a 30 fps stream with a keyframe every `gop` packets
pub fn packets(codec: CodecKind, count: usize, gop: usize) -> Vec<Packet> {
    (0..count)
        .map(|i| {
            let key = i % gop.max(1) == 0;
            let nal: &[u8] = match (codec, key) {
                (CodecKind::H264, true) => &[0, 0, 0, 1, 0x65, 0x88],
                (CodecKind::H264, false) => &[0, 0, 0, 1, 0x41, 0x9a],
                (CodecKind::Hevc, true) => &[0, 0, 0, 1, 0x26, 0x01, 0xaf],
                (CodecKind::Hevc, false) => &[0, 0, 0, 1, 0x02, 0x01, 0xd0],
            };
            Packet::new(nal.to_vec(), pts_at(i), key)
        })
        .collect()
}

/// Presentation time of frame `index` at 30 fps, in milliseconds
pub fn pts_at(index: usize) -> i64 {
    (index as i64 * 1000) / 30
}
