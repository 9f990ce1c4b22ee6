// camdecode - Adaptive hardware-accelerated camera stream decoding
// Main library entry point
//
// Pipeline: bootstrap -> capability detection -> per-stream sessions
// (hardware or software decode) -> frame normalization -> sink

pub mod bootstrap;
pub mod capability;
pub mod config;
pub mod decoder;
pub mod nal;
pub mod normalizer;
pub mod packet_queue;
pub mod sampling;
pub mod scheduler;
pub mod session;

pub use capability::{AcceleratorKind, CapabilityDescriptor, CapabilityDetector};
pub use config::{PipelineConfig, StreamConfig, VideoQuality};
pub use decoder::{CodecKind, DecoderError, DecoderPath, Packet};
pub use normalizer::{DecodedFrame, PixelFormat};
pub use scheduler::{FrameSink, StreamEvent, StreamScheduler, StreamStatus};
pub use session::{CloseReason, SessionState, StreamDecodeSession};
