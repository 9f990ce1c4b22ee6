//! Stream scheduler
//!
//! One worker thread per camera. Each worker owns its session, pulls packets
//! from the stream's bounded queue, decodes every packet and hands sampled
//! frames to the sink. Workers share nothing but the capability cache, so a
//! failing or panicking stream never affects the others.

use crate::capability::CapabilityDetector;
use crate::config::{StreamConfig, VideoQuality};
use crate::decoder::{DecoderBackend, DecoderPath, Packet};
use crate::normalizer::DecodedFrame;
use crate::packet_queue::{PacketQueue, PopResult, PushOutcome};
use crate::session::{CloseReason, SessionState, StreamDecodeSession};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a worker waits for a packet before checking for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Stream {0} already exists")]
    DuplicateStream(String),
    #[error("Unknown stream {0}")]
    UnknownStream(String),
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),
}

/// Consumer of normalized frames.
///
/// Frames are moved into the sink; keep a copy if it must outlive the call.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, stream_id: &str, frame: DecodedFrame);

    /// The stream's session closed and its worker is exiting
    fn on_closed(&self, _stream_id: &str, _reason: &CloseReason) {}
}

impl<F> FrameSink for F
where
    F: Fn(&str, DecodedFrame) + Send + Sync,
{
    fn on_frame(&self, stream_id: &str, frame: DecodedFrame) {
        self(stream_id, frame)
    }
}

/// Lifecycle notifications, in order per stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Started { stream_id: String },
    PathSelected { stream_id: String, path: DecoderPath },
    FellBack { stream_id: String, reason: String },
    Closed { stream_id: String, reason: CloseReason },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::Started { stream_id }
            | StreamEvent::PathSelected { stream_id, .. }
            | StreamEvent::FellBack { stream_id, .. }
            | StreamEvent::Closed { stream_id, .. } => stream_id,
        }
    }
}

/// Point-in-time view of one stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub state: SessionState,
    pub active_path: Option<DecoderPath>,
    pub quality: VideoQuality,
    pub frames_decoded: u64,
    pub frames_emitted: u64,
    pub packets_dropped: u64,
    pub last_emitted_pts: Option<i64>,
    pub close_reason: Option<CloseReason>,
}

impl StreamStatus {
    fn starting(config: &StreamConfig) -> Self {
        Self {
            stream_id: config.stream_id.clone(),
            state: SessionState::Init,
            active_path: None,
            quality: config.quality,
            frames_decoded: 0,
            frames_emitted: 0,
            packets_dropped: 0,
            last_emitted_pts: None,
            close_reason: None,
        }
    }
}

/// Producer handle for one stream's packet queue
#[derive(Clone)]
pub struct PacketSender {
    stream_id: String,
    queue: Arc<PacketQueue>,
}

impl PacketSender {
    pub fn send(&self, packet: Packet) -> PushOutcome {
        self.queue.push(packet)
    }

    /// Signal end of input; the worker drains and closes the stream
    pub fn finish(&self) {
        self.queue.close();
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

struct StreamHandle {
    queue: Arc<PacketQueue>,
    cancel: Arc<AtomicBool>,
    status: Arc<RwLock<StreamStatus>>,
    worker: Option<JoinHandle<()>>,
}

impl StreamHandle {
    fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.queue.wake();
    }

    fn join(mut self) -> StreamStatus {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Worker for {} exited abnormally", self.status.read().stream_id);
            }
        }
        self.status.read().clone()
    }
}

pub struct StreamScheduler {
    backend: Arc<dyn DecoderBackend>,
    detector: Arc<CapabilityDetector>,
    sink: Arc<dyn FrameSink>,
    streams: RwLock<HashMap<String, StreamHandle>>,
    events_tx: Sender<StreamEvent>,
    events_rx: Receiver<StreamEvent>,
}

impl StreamScheduler {
    pub fn new(
        backend: Arc<dyn DecoderBackend>,
        detector: Arc<CapabilityDetector>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            backend,
            detector,
            sink,
            streams: RwLock::new(HashMap::new()),
            events_tx,
            events_rx,
        }
    }

    /// Start a worker for `config`
    pub fn add_stream(&self, config: StreamConfig) -> Result<String, SchedulerError> {
        let stream_id = config.stream_id.clone();
        let mut streams = self.streams.write();
        if streams.contains_key(&stream_id) {
            return Err(SchedulerError::DuplicateStream(stream_id));
        }

        let queue = Arc::new(PacketQueue::new(config.queue_capacity));
        let cancel = Arc::new(AtomicBool::new(false));
        let status = Arc::new(RwLock::new(StreamStatus::starting(&config)));

        let worker = Worker {
            stream_id: stream_id.clone(),
            config,
            detector: self.detector.clone(),
            backend: self.backend.clone(),
            sink: self.sink.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            status: status.clone(),
            events: self.events_tx.clone(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("decode-{}", stream_id))
            .spawn(move || worker.run())
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        streams.insert(
            stream_id.clone(),
            StreamHandle {
                queue,
                cancel,
                status,
                worker: Some(handle),
            },
        );
        log::info!("Stream {} added", stream_id);
        Ok(stream_id)
    }

    /// Stop a stream at its next packet boundary and wait for the worker
    pub fn remove_stream(&self, stream_id: &str) -> Result<StreamStatus, SchedulerError> {
        let handle = self
            .streams
            .write()
            .remove(stream_id)
            .ok_or_else(|| SchedulerError::UnknownStream(stream_id.to_string()))?;
        handle.cancel();
        let status = handle.join();
        log::info!("Stream {} removed", stream_id);
        Ok(status)
    }

    /// Wait for a stream to close on its own (end of input or failure)
    pub fn join_stream(&self, stream_id: &str) -> Result<StreamStatus, SchedulerError> {
        let handle = self
            .streams
            .write()
            .remove(stream_id)
            .ok_or_else(|| SchedulerError::UnknownStream(stream_id.to_string()))?;
        Ok(handle.join())
    }

    pub fn submit_packet(
        &self,
        stream_id: &str,
        packet: Packet,
    ) -> Result<PushOutcome, SchedulerError> {
        let streams = self.streams.read();
        let handle = streams
            .get(stream_id)
            .ok_or_else(|| SchedulerError::UnknownStream(stream_id.to_string()))?;
        Ok(handle.queue.push(packet))
    }

    pub fn packet_sender(&self, stream_id: &str) -> Result<PacketSender, SchedulerError> {
        let streams = self.streams.read();
        let handle = streams
            .get(stream_id)
            .ok_or_else(|| SchedulerError::UnknownStream(stream_id.to_string()))?;
        Ok(PacketSender {
            stream_id: stream_id.to_string(),
            queue: handle.queue.clone(),
        })
    }

    /// No more packets will arrive for `stream_id`
    pub fn end_of_stream(&self, stream_id: &str) -> Result<(), SchedulerError> {
        let streams = self.streams.read();
        let handle = streams
            .get(stream_id)
            .ok_or_else(|| SchedulerError::UnknownStream(stream_id.to_string()))?;
        handle.queue.close();
        Ok(())
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.streams
            .read()
            .get(stream_id)
            .map(|handle| handle.status.read().clone())
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<StreamStatus> = self
            .streams
            .read()
            .values()
            .map(|handle| handle.status.read().clone())
            .collect();
        statuses.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        statuses
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Lifecycle events of every stream
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.events_rx.clone()
    }

    /// Stop every stream and wait for all workers
    pub fn shutdown(&self) {
        let handles: Vec<StreamHandle> = self.streams.write().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        log::info!("Stopping {} stream(s)", handles.len());
        for handle in &handles {
            handle.cancel();
        }
        for handle in handles {
            handle.join();
        }
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    stream_id: String,
    config: StreamConfig,
    detector: Arc<CapabilityDetector>,
    backend: Arc<dyn DecoderBackend>,
    sink: Arc<dyn FrameSink>,
    queue: Arc<PacketQueue>,
    cancel: Arc<AtomicBool>,
    status: Arc<RwLock<StreamStatus>>,
    events: Sender<StreamEvent>,
}

impl Worker {
    fn run(self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.drive()));
        let reason = match result {
            Ok(reason) => reason,
            Err(payload) => {
                let reason = CloseReason::WorkerPanicked(panic_message(payload.as_ref()));
                log::error!("[{}] stream closed: {}", self.stream_id, reason);
                let mut status = self.status.write();
                status.state = SessionState::Closed;
                status.active_path = None;
                status.close_reason = Some(reason.clone());
                reason
            }
        };

        // Producers see `PushOutcome::Closed` from here on
        self.queue.close();
        self.sink.on_closed(&self.stream_id, &reason);
        self.emit(StreamEvent::Closed {
            stream_id: self.stream_id.clone(),
            reason,
        });
    }

    fn drive(&self) -> CloseReason {
        let capability = self.detector.detect(self.config.device_hint.as_deref());
        let mut session =
            StreamDecodeSession::open(&self.config, capability, self.backend.clone());

        self.emit(StreamEvent::Started {
            stream_id: self.stream_id.clone(),
        });
        let mut seen = PathReport::default();
        self.report_path(&session, &mut seen);
        self.publish(&session);

        while !session.is_closed() {
            if self.cancel.load(Ordering::SeqCst) {
                session.stop();
                break;
            }

            match self.queue.pop_timeout(POLL_INTERVAL) {
                PopResult::Packet(packet) => {
                    for frame in session.submit_packet(packet).sampled() {
                        self.sink.on_frame(&self.stream_id, frame);
                    }
                }
                PopResult::Empty => continue,
                PopResult::Closed => {
                    log::debug!("[{}] input ended, flushing decoder", self.stream_id);
                    for frame in session.finish().sampled() {
                        self.sink.on_frame(&self.stream_id, frame);
                    }
                }
            }

            self.report_path(&session, &mut seen);
            self.publish(&session);
        }

        self.publish(&session);
        session
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::Stopped)
    }

    fn report_path(&self, session: &StreamDecodeSession, seen: &mut PathReport) {
        if !seen.fell_back {
            if let Some(reason) = session.fallback_reason() {
                seen.fell_back = true;
                self.emit(StreamEvent::FellBack {
                    stream_id: self.stream_id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        if let Some(path) = session.active_path() {
            if seen.path != Some(path) {
                seen.path = Some(path);
                self.emit(StreamEvent::PathSelected {
                    stream_id: self.stream_id.clone(),
                    path,
                });
            }
        }
    }

    fn publish(&self, session: &StreamDecodeSession) {
        let mut status = self.status.write();
        status.state = session.state();
        status.active_path = session.active_path();
        status.frames_decoded = session.frames_decoded();
        status.frames_emitted = session.frames_emitted();
        status.packets_dropped = self.queue.dropped();
        status.last_emitted_pts = session.last_emitted_pts();
        status.close_reason = session.close_reason().cloned();
    }

    fn emit(&self, event: StreamEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Path events already emitted by a worker
#[derive(Default)]
struct PathReport {
    path: Option<DecoderPath>,
    fell_back: bool,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
