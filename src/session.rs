//! Per-camera decode session
//!
//! A session owns at most one decoder context. It starts on hardware when
//! the accelerator is usable and requested, falls back to software at most
//! once, and closes on the second unrecoverable error.

use crate::capability::CapabilityDescriptor;
use crate::config::StreamConfig;
use crate::decoder::{
    ActiveDecoder, CodecKind, DecoderBackend, DecoderError, DecoderPath, ErrorClass, Packet,
};
use crate::nal;
use crate::normalizer::{DecodedFrame, FrameNormalizer, NormalizeError};
use crate::sampling::FrameSampler;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Packets kept since the last keyframe for re-priming a fallback decoder
pub const GOP_REPLAY_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    TryingHardware,
    HardwareActive,
    FallbackSoftware,
    SoftwareActive,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::TryingHardware => "TRYING_HARDWARE",
            SessionState::HardwareActive => "HARDWARE_ACTIVE",
            SessionState::FallbackSoftware => "FALLBACK_SOFTWARE",
            SessionState::SoftwareActive => "SOFTWARE_ACTIVE",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Why a session reached `Closed`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    #[error("stopped")]
    Stopped,
    #[error("source ended")]
    SourceEnded,
    #[error("codec {0} not supported on any decode path")]
    UnsupportedCodec(CodecKind),
    #[error("decoder context invalidated on software path: {0}")]
    StructuralOnSoftware(String),
    #[error("resources exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("failed to initialize decoder: {0}")]
    DecoderInit(String),
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl CloseReason {
    /// Closed by a failure rather than a normal end of stream
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::Stopped | CloseReason::SourceEnded)
    }
}

pub struct StreamDecodeSession {
    stream_id: String,
    codec: CodecKind,
    max_transient_errors: u32,
    hardware_requested: bool,
    capability: Arc<CapabilityDescriptor>,
    backend: Arc<dyn DecoderBackend>,
    decoder: Option<ActiveDecoder>,
    state: SessionState,
    history: Vec<SessionState>,
    hardware_attempted: bool,
    fallback_reason: Option<String>,
    close_reason: Option<CloseReason>,
    normalizer: FrameNormalizer,
    sampler: FrameSampler,
    // Packets since the last keyframe; None until one arrives or after overflow
    gop: Option<VecDeque<Packet>>,
    last_decoded_pts: Option<i64>,
    last_emitted_pts: Option<i64>,
    replay_floor: Option<i64>,
    consecutive_transient: u32,
    packets_submitted: u64,
    frames_decoded: u64,
    frames_emitted: u64,
}

impl StreamDecodeSession {
    /// Create a session and pick its initial decode path.
    ///
    /// Never fails: a session that cannot decode at all comes back already
    /// `Closed` with its reason set.
    pub fn open(
        config: &StreamConfig,
        capability: Arc<CapabilityDescriptor>,
        backend: Arc<dyn DecoderBackend>,
    ) -> Self {
        let hardware_requested = config.enable_hw_accel
            && capability.available
            && capability.accelerator == config.hw_accel_kind;

        let mut session = Self {
            stream_id: config.stream_id.clone(),
            codec: config.codec,
            max_transient_errors: config.max_transient_errors,
            hardware_requested,
            capability,
            backend,
            decoder: None,
            state: SessionState::Init,
            history: vec![SessionState::Init],
            hardware_attempted: false,
            fallback_reason: None,
            close_reason: None,
            normalizer: FrameNormalizer::new(),
            sampler: FrameSampler::new(config.sample_interval_ms),
            gop: None,
            last_decoded_pts: None,
            last_emitted_pts: None,
            replay_floor: None,
            consecutive_transient: 0,
            packets_submitted: 0,
            frames_decoded: 0,
            frames_emitted: 0,
        };

        if !config.enable_hw_accel {
            log::debug!("[{}] hardware acceleration disabled", session.stream_id);
        } else if !session.capability.available {
            log::debug!(
                "[{}] accelerator unavailable: {}",
                session.stream_id,
                session.capability.reason.as_deref().unwrap_or("unknown")
            );
        } else if !hardware_requested {
            log::debug!(
                "[{}] requested accelerator {:?} but found {:?}",
                session.stream_id,
                config.hw_accel_kind,
                session.capability.accelerator
            );
        }

        session.select_initial_path();
        session
    }

    fn select_initial_path(&mut self) {
        if !self.hardware_requested {
            self.open_software();
            return;
        }

        self.transition(SessionState::TryingHardware);
        self.hardware_attempted = true;
        match self.backend.open_hardware(self.codec, &self.capability) {
            Ok(ctx) => {
                self.decoder = Some(ActiveDecoder::Hardware(ctx));
                self.transition(SessionState::HardwareActive);
                log::info!(
                    "[{}] hardware enabled ({}, {})",
                    self.stream_id,
                    self.decoder_info().unwrap_or("unknown"),
                    self.codec
                );
            }
            Err(e) => self.fall_back(e.to_string()),
        }
    }

    /// Enter FALLBACK_SOFTWARE and try to open the software context
    fn fall_back(&mut self, reason: String) {
        self.transition(SessionState::FallbackSoftware);
        if self.fallback_reason.is_none() {
            log::warn!("[{}] falling back to software: {}", self.stream_id, reason);
            self.fallback_reason = Some(reason);
        }
        self.open_software();
    }

    fn open_software(&mut self) {
        match self.backend.open_software(self.codec) {
            Ok(ctx) => {
                self.decoder = Some(ActiveDecoder::Software(ctx));
                self.transition(SessionState::SoftwareActive);
                log::info!(
                    "[{}] software decoding ({}, {})",
                    self.stream_id,
                    self.decoder_info().unwrap_or("unknown"),
                    self.codec
                );
            }
            Err(DecoderError::UnsupportedCodec(codec)) => {
                self.close(CloseReason::UnsupportedCodec(codec))
            }
            Err(DecoderError::ResourceExhaustion(msg)) => {
                self.close(CloseReason::ResourceExhaustion(msg))
            }
            Err(e) => self.close(CloseReason::DecoderInit(e.to_string())),
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("[{}] {} -> {}", self.stream_id, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Feed one packet and return the frames it made available.
    ///
    /// The packet reaches the decoder immediately; frames are decoded,
    /// ordered and normalized as the iterator is advanced. Frames left in
    /// an unconsumed iterator come out of the next call.
    pub fn submit_packet(&mut self, packet: Packet) -> Frames<'_> {
        if self.state == SessionState::Closed {
            log::debug!("[{}] dropping packet pts={} on closed session", self.stream_id, packet.pts);
            return Frames::exhausted(self);
        }

        let packet = self.verify_keyframe(packet);
        self.record_gop(&packet);
        self.packets_submitted += 1;
        self.feed(&packet);
        Frames::new(self)
    }

    /// End of input: flush the decoder and hand out what it still holds.
    ///
    /// The session closes with [`CloseReason::SourceEnded`] once the
    /// returned iterator is exhausted.
    pub fn finish(&mut self) -> Frames<'_> {
        if self.state == SessionState::Closed {
            return Frames::exhausted(self);
        }

        // A failing flush on hardware falls back and replays; flush the
        // software context that replaced it as well.
        for _ in 0..2 {
            let Some(decoder) = self.decoder.as_mut() else {
                break;
            };
            let path = decoder.path();
            match decoder.context_mut().flush() {
                Ok(()) => break,
                Err(e) => {
                    self.handle_error(e);
                    if self.active_path() == Some(path) {
                        break;
                    }
                }
            }
        }

        let mut frames = Frames::new(self);
        frames.finishing = true;
        frames
    }

    /// Close with [`CloseReason::Stopped`]
    pub fn stop(&mut self) {
        self.close(CloseReason::Stopped);
    }

    /// Release the decoder and enter `Closed`. Only the first reason sticks.
    pub fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.release_decoder();
        self.transition(SessionState::Closed);
        if reason.is_failure() {
            log::error!("[{}] stream closed: {}", self.stream_id, reason);
        } else {
            log::info!("[{}] stream closed: {}", self.stream_id, reason);
        }
        self.close_reason = Some(reason);
    }

    fn release_decoder(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            log::debug!("[{}] releasing {} decoder", self.stream_id, decoder.path());
            decoder.close();
        }
    }

    // Trust the bitstream over a missing keyframe flag
    fn verify_keyframe(&self, mut packet: Packet) -> Packet {
        if !packet.is_keyframe && nal::is_keyframe(self.codec, &packet.data) {
            log::debug!("[{}] packet pts={} carries a keyframe", self.stream_id, packet.pts);
            packet.is_keyframe = true;
        }
        packet
    }

    fn record_gop(&mut self, packet: &Packet) {
        if packet.is_keyframe {
            self.gop = Some(VecDeque::new());
        }
        let Some(gop) = self.gop.as_mut() else {
            return;
        };
        if gop.len() >= GOP_REPLAY_LIMIT {
            log::debug!(
                "[{}] keyframe interval exceeds {} packets, replay disabled until next keyframe",
                self.stream_id,
                GOP_REPLAY_LIMIT
            );
            self.gop = None;
            return;
        }
        gop.push_back(packet.clone());
    }

    fn feed(&mut self, packet: &Packet) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        match decoder.context_mut().submit(packet) {
            Ok(()) => self.consecutive_transient = 0,
            Err(e) => self.handle_error(e),
        }
    }

    fn handle_error(&mut self, error: DecoderError) {
        match error.class() {
            ErrorClass::Transient => {
                self.consecutive_transient += 1;
                if self.consecutive_transient <= self.max_transient_errors {
                    log::warn!("[{}] skipping packet: {}", self.stream_id, error);
                    return;
                }
                let count = self.consecutive_transient;
                self.consecutive_transient = 0;
                // A burst on hardware uses up the one fallback; software keeps skipping
                if self.active_path() == Some(DecoderPath::Hardware) {
                    self.runtime_fallback(format!("{} consecutive transient errors", count));
                } else {
                    log::warn!(
                        "[{}] {} consecutive transient errors, still skipping: {}",
                        self.stream_id,
                        count,
                        error
                    );
                }
            }
            ErrorClass::Structural | ErrorClass::Recoverable => {
                let message = error.to_string();
                self.on_structural(message.clone(), CloseReason::StructuralOnSoftware(message));
            }
            ErrorClass::Fatal => match error {
                DecoderError::UnsupportedCodec(codec) => {
                    self.close(CloseReason::UnsupportedCodec(codec))
                }
                other => self.close(CloseReason::ResourceExhaustion(other.to_string())),
            },
        }
    }

    fn on_structural(&mut self, reason: String, on_software: CloseReason) {
        match self.active_path() {
            Some(DecoderPath::Hardware) => self.runtime_fallback(reason),
            Some(DecoderPath::Software) => self.close(on_software),
            None => {}
        }
    }

    fn runtime_fallback(&mut self, reason: String) {
        let floor = self.last_decoded_pts;
        self.release_decoder();
        self.fall_back(reason);
        if self.state != SessionState::SoftwareActive {
            return;
        }

        self.replay_floor = floor;
        let Some(gop) = self.gop.as_ref() else {
            log::debug!("[{}] no keyframe buffered, resuming at next keyframe", self.stream_id);
            return;
        };
        let replay: Vec<Packet> = gop.iter().cloned().collect();
        log::info!(
            "[{}] replaying {} packet(s) from last keyframe",
            self.stream_id,
            replay.len()
        );
        for packet in &replay {
            if self.state != SessionState::SoftwareActive {
                break;
            }
            self.feed(packet);
        }
    }

    // Frames must come out in non-decreasing pts order; frames already
    // delivered before a fallback are suppressed when the replay yields them again.
    fn accept_order(&mut self, pts: i64) -> bool {
        if let Some(floor) = self.replay_floor {
            if pts <= floor {
                return false;
            }
            self.replay_floor = None;
        }
        if self.last_decoded_pts.is_some_and(|last| pts < last) {
            return false;
        }
        self.last_decoded_pts = Some(pts);
        true
    }

    fn pull_frame(&mut self, sampled: bool) -> Option<DecodedFrame> {
        loop {
            let decoder = self.decoder.as_mut()?;
            let raw = match decoder.context_mut().drain() {
                Ok(Some(raw)) => raw,
                Ok(None) => return None,
                Err(e) => {
                    self.handle_error(e);
                    continue;
                }
            };

            if !self.accept_order(raw.pts) {
                log::debug!("[{}] dropping out-of-order frame pts={}", self.stream_id, raw.pts);
                continue;
            }
            self.frames_decoded += 1;

            if sampled && !self.sampler.should_emit(raw.pts) {
                continue;
            }

            match self.normalizer.normalize(raw) {
                Ok(frame) => {
                    if sampled {
                        self.sampler.mark_emitted(frame.pts);
                    }
                    self.consecutive_transient = 0;
                    self.last_emitted_pts = Some(frame.pts);
                    self.frames_emitted += 1;
                    return Some(frame);
                }
                Err(NormalizeError::Transfer(e)) => self.handle_error(e),
                Err(e) => self.handle_error(DecoderError::Transient(e.to_string())),
            }
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered, oldest first
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn active_path(&self) -> Option<DecoderPath> {
        self.decoder.as_ref().map(ActiveDecoder::path)
    }

    pub fn decoder_info(&self) -> Option<&str> {
        self.decoder.as_ref().map(ActiveDecoder::info)
    }

    pub fn hardware_attempted(&self) -> bool {
        self.hardware_attempted
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn packets_submitted(&self) -> u64 {
        self.packets_submitted
    }

    /// Frames that left the decoder in order, sampled or not
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn last_emitted_pts(&self) -> Option<i64> {
        self.last_emitted_pts
    }

    pub fn sample_interval_ms(&self) -> u64 {
        self.sampler.interval_ms()
    }

    pub fn device_transfers(&self) -> u64 {
        self.normalizer.device_transfers()
    }
}

impl Drop for StreamDecodeSession {
    fn drop(&mut self) {
        self.release_decoder();
    }
}

/// Frames made available by one call into the session
pub struct Frames<'a> {
    session: &'a mut StreamDecodeSession,
    sampled: bool,
    finishing: bool,
    done: bool,
}

impl<'a> Frames<'a> {
    fn new(session: &'a mut StreamDecodeSession) -> Self {
        Self {
            session,
            sampled: false,
            finishing: false,
            done: false,
        }
    }

    fn exhausted(session: &'a mut StreamDecodeSession) -> Self {
        Self {
            done: true,
            ..Self::new(session)
        }
    }

    /// Only yield frames due under the session's sampling interval.
    ///
    /// Skipped frames are still decoded but never normalized.
    pub fn sampled(mut self) -> Self {
        self.sampled = true;
        self
    }
}

impl Iterator for Frames<'_> {
    type Item = DecodedFrame;

    fn next(&mut self) -> Option<DecodedFrame> {
        if self.done {
            return None;
        }
        match self.session.pull_frame(self.sampled) {
            Some(frame) => Some(frame),
            None => {
                self.done = true;
                if self.finishing {
                    self.session.close(CloseReason::SourceEnded);
                }
                None
            }
        }
    }
}
