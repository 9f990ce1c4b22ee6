//! Hardware accelerator capability detection
//!
//! Probing is explicit: the device node is checked first, then the native
//! library is asked which codecs the accelerator can decode. Any failure
//! along the way yields an unavailable descriptor rather than an error.
//! Results are cached per requested device until explicitly invalidated.

use crate::decoder::{CodecKind, DecoderError};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Device nodes tried when no device is configured
pub const DEFAULT_VAAPI_DEVICES: [&str; 2] = ["/dev/dri/renderD128", "/dev/dri/card0"];

/// Upper bound on how long a single probe may take
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    None,
    Vaapi,
    Other,
}

impl AcceleratorKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => AcceleratorKind::None,
            "vaapi" => AcceleratorKind::Vaapi,
            _ => AcceleratorKind::Other,
        }
    }
}

/// Immutable snapshot of what hardware decoding can do in this process
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDescriptor {
    pub available: bool,
    pub accelerator: AcceleratorKind,
    pub device_path: Option<PathBuf>,
    /// Codecs the accelerator reported it can decode
    pub supported_codecs: Vec<CodecKind>,
    pub probed_at: SystemTime,
    /// Why the accelerator is unavailable, when it is
    pub reason: Option<String>,
}

impl CapabilityDescriptor {
    pub fn unavailable(device_path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            available: false,
            accelerator: AcceleratorKind::None,
            device_path,
            supported_codecs: Vec::new(),
            probed_at: SystemTime::now(),
            reason: Some(reason.into()),
        }
    }

    pub fn supports(&self, codec: CodecKind) -> bool {
        self.available && self.supported_codecs.contains(&codec)
    }
}

/// Native query interface of an accelerator runtime
pub trait AcceleratorProbe: Send + Sync {
    fn kind(&self) -> AcceleratorKind;

    /// Open the accelerator at `device` and list the codecs it decodes
    fn supported_codecs(&self, device: &Path) -> Result<Vec<CodecKind>, DecoderError>;
}

/// Probe backed by the accelerator libraries compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProbe;

impl AcceleratorProbe for NativeProbe {
    fn kind(&self) -> AcceleratorKind {
        AcceleratorKind::Vaapi
    }

    #[allow(unused_variables)]
    fn supported_codecs(&self, device: &Path) -> Result<Vec<CodecKind>, DecoderError> {
        crate::bootstrap::ensure_library_paths_configured();

        #[cfg(all(feature = "ffmpeg", target_os = "linux"))]
        {
            crate::decoder::ffmpeg::vaapi::probe_codecs(device)
        }

        #[cfg(not(all(feature = "ffmpeg", target_os = "linux")))]
        {
            Err(DecoderError::AcceleratorInit(
                "hardware decoding support not compiled in".to_string(),
            ))
        }
    }
}

type CacheKey = Option<PathBuf>;

/// Write-once cache of capability descriptors, keyed by requested device.
///
/// Concurrent first callers for the same device block on one in-flight
/// probe. Once written a descriptor is only replaced through `invalidate`.
pub struct CapabilityDetector {
    probe: Arc<dyn AcceleratorProbe>,
    timeout: Duration,
    cache: RwLock<HashMap<CacheKey, Arc<OnceCell<Arc<CapabilityDescriptor>>>>>,
}

impl CapabilityDetector {
    pub fn new(probe: Arc<dyn AcceleratorProbe>) -> Self {
        Self {
            probe,
            timeout: DEFAULT_PROBE_TIMEOUT,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the cached descriptor for `requested`, probing on first use
    pub fn detect(&self, requested: Option<&Path>) -> Arc<CapabilityDescriptor> {
        let key: CacheKey = requested.map(Path::to_path_buf);
        let cell = self.cell(&key);
        cell.get_or_init(|| Arc::new(self.probe_now(requested)))
            .clone()
    }

    /// Drop the cached descriptor for `requested` so the next call re-probes
    pub fn invalidate(&self, requested: Option<&Path>) {
        let key: CacheKey = requested.map(Path::to_path_buf);
        if self.cache.write().remove(&key).is_some() {
            log::info!("Capability cache invalidated for {:?}", key);
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.write().clear();
        log::info!("Capability cache cleared");
    }

    fn cell(&self, key: &CacheKey) -> Arc<OnceCell<Arc<CapabilityDescriptor>>> {
        if let Some(cell) = self.cache.read().get(key) {
            return cell.clone();
        }
        self.cache
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn probe_now(&self, requested: Option<&Path>) -> CapabilityDescriptor {
        let Some(device) = resolve_device(requested) else {
            let reason = match requested {
                Some(path) => format!("no accelerator device at {}", path.display()),
                None => "no accelerator device found".to_string(),
            };
            log::info!("{}, will use software decoding", reason);
            return CapabilityDescriptor::unavailable(requested.map(Path::to_path_buf), reason);
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = Arc::clone(&self.probe);
        let probe_device = device.clone();
        let spawned = std::thread::Builder::new()
            .name("accel-probe".to_string())
            .spawn(move || {
                let _ = tx.send(probe.supported_codecs(&probe_device));
            });
        if let Err(e) = spawned {
            log::warn!("Failed to spawn accelerator probe: {}", e);
            return CapabilityDescriptor::unavailable(Some(device), e.to_string());
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(codecs)) if !codecs.is_empty() => {
                log::info!(
                    "{:?} accelerator at {} supports {:?}",
                    self.probe.kind(),
                    device.display(),
                    codecs
                );
                CapabilityDescriptor {
                    available: true,
                    accelerator: self.probe.kind(),
                    device_path: Some(device),
                    supported_codecs: codecs,
                    probed_at: SystemTime::now(),
                    reason: None,
                }
            }
            Ok(Ok(_)) => {
                log::info!("Accelerator at {} decodes no known codec", device.display());
                CapabilityDescriptor::unavailable(Some(device), "accelerator supports no codec")
            }
            Ok(Err(e)) => {
                log::warn!("Accelerator probe failed on {}: {}", device.display(), e);
                CapabilityDescriptor::unavailable(Some(device), e.to_string())
            }
            Err(_) => {
                log::warn!(
                    "Accelerator probe on {} timed out after {:?}",
                    device.display(),
                    self.timeout
                );
                CapabilityDescriptor::unavailable(
                    Some(device),
                    format!("probe timed out after {:?}", self.timeout),
                )
            }
        }
    }
}

/// Pick the device node to probe, cheap filesystem checks only
fn resolve_device(requested: Option<&Path>) -> Option<PathBuf> {
    match requested {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => DEFAULT_VAAPI_DEVICES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    }
}

/// Process-wide detector using the native probe
static GLOBAL_DETECTOR: Lazy<Arc<CapabilityDetector>> =
    Lazy::new(|| Arc::new(CapabilityDetector::new(Arc::new(NativeProbe))));

/// Get the process-wide detector
pub fn global_detector() -> Arc<CapabilityDetector> {
    GLOBAL_DETECTOR.clone()
}

/// Detect with the process-wide detector
pub fn detect(requested: Option<&Path>) -> Arc<CapabilityDescriptor> {
    crate::bootstrap::ensure_library_paths_configured();
    GLOBAL_DETECTOR.detect(requested)
}

/// Force the process-wide detector to re-probe `requested` on next use
pub fn invalidate(requested: Option<&Path>) {
    GLOBAL_DETECTOR.invalidate(requested);
}
