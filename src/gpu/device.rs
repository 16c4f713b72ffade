// gpu/device.rs — the device session: instance, adapter, device, queue.
//
// Responsibilities:
//   - Enumerate adapters and select exactly one GPU-class adapter.
//   - Request a device with timestamp queries enabled when the adapter
//     supports them (the wgpu counterpart of a profiling-enabled queue).
//   - Route uncaptured device errors and device loss into the probe so a
//     driver-side failure is reported instead of panicking the process.
//   - Provide `scoped()`, which runs one device call inside a validation
//     error scope and hands back the captured error. wgpu reports most
//     failures asynchronously through error scopes rather than return
//     values; `scoped()` turns that into a per-call status.
//
// ADAPTER SELECTION:
// `request_adapter` uses power-preference heuristics that happily return
// a software rasteriser (llvmpipe, WARP) when one is installed. We
// enumerate explicitly and prefer real hardware; a CPU adapter is only
// taken when `DeviceOptions::allow_software` is set (CI runners).
//
// QUEUE ORDERING:
// A wgpu queue executes submissions in order, which is the only ordering
// guarantee the pipeline relies on: upload → dispatch → read-back.
//
// DROP ORDER:
// Rust drops struct fields top → bottom. `_instance` is declared last so
// the instance outlives `device` and `queue`; some Vulkan layers crash
// when the instance is destroyed before device-level objects.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::probe::{self, StatusCode};

/// Hardware profile controlling the limits requested from the adapter.
///
/// `Constrained` requests *lower* limits than most desktop GPUs support.
/// wgpu validates every dispatch against the requested limits, so a
/// group count or workgroup size that would fail on a small embedded GPU
/// is rejected on the development machine too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// wgpu default limits.
    #[default]
    Native,
    /// Small embedded GPU: 256 invocations per workgroup, 128 MiB storage
    /// bindings.
    Constrained,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Constrained => write!(f, "Constrained (simulated limits)"),
        }
    }
}

/// Options for [`DeviceSession::open`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    pub profile: DeviceProfile,
    pub backends: wgpu::Backends,
    /// Accept a CPU/software adapter when no hardware adapter exists.
    pub allow_software: bool,
    /// Request `TIMESTAMP_QUERY` if the adapter has it.
    pub timestamps: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            profile: DeviceProfile::Native,
            backends: wgpu::Backends::PRIMARY,
            allow_software: false,
            timestamps: true,
        }
    }
}

impl DeviceOptions {
    /// Any backend, software adapters allowed. Lets lavapipe or WARP stand
    /// in when no hardware GPU is present (CI runners, containers).
    pub fn permissive() -> Self {
        DeviceOptions {
            backends: wgpu::Backends::all(),
            allow_software: true,
            ..DeviceOptions::default()
        }
    }
}

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Errors from standing up or synchronising with the device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no suitable GPU adapter found on backends {0:?}")]
    NoSuitableAdapter(wgpu::Backends),

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("device lost: {0}")]
    Lost(String),
}

impl StatusCode for DeviceError {
    fn code(&self) -> i32 {
        match self {
            DeviceError::NoSuitableAdapter(_) => -10,
            DeviceError::DeviceRequest(_) => -11,
            DeviceError::Lost(_) => -12,
        }
    }
}

/// Device-side status captured from one call, the wgpu analogue of a
/// non-success status code.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DeviceStatus(pub wgpu::Error);

impl StatusCode for DeviceStatus {
    fn code(&self) -> i32 {
        match self.0 {
            wgpu::Error::OutOfMemory { .. } => -20,
            wgpu::Error::Validation { .. } => -21,
            #[allow(unreachable_patterns)]
            _ => -22,
        }
    }
}

/// One open device: adapter, device, queue and capabilities.
///
/// Created once per process and released once, by `Drop`, on every exit
/// path. Everything allocated from `device` (buffers, programs) must be
/// dropped before the session; the pipeline guarantees that by scope.
pub struct DeviceSession {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    timestamps: bool,
    lost: Arc<Mutex<Option<String>>>,
    /// Keeps the instance alive until `device` and `queue` are dropped.
    _instance: wgpu::Instance,
}

impl DeviceSession {
    /// Open a session on the first suitable adapter.
    ///
    /// # Errors
    /// `NoSuitableAdapter` when enumeration finds nothing usable,
    /// `DeviceRequest` when the driver refuses the device.
    pub fn open(options: &DeviceOptions) -> Result<Self, DeviceError> {
        pollster::block_on(Self::open_async(options))
    }

    async fn open_async(options: &DeviceOptions) -> Result<Self, DeviceError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: options.backends,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(options.backends);
        for a in &adapters {
            let info = a.get_info();
            tracing::debug!(
                "adapter: {} ({:?}, {:?})",
                info.name,
                info.backend,
                info.device_type
            );
        }

        let adapter = select_adapter(adapters, options.allow_software)
            .ok_or(DeviceError::NoSuitableAdapter(options.backends))?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let timestamps =
            options.timestamps && adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        if options.timestamps && !timestamps {
            probe::report_warning(
                "adapter has no TIMESTAMP_QUERY support; kernel time will read 0",
            );
        }
        let required_features = if timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpufilter"),
                    required_features,
                    required_limits: limits_for_profile(options.profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        // Without a handler wgpu panics on any error raised outside an
        // error scope.
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            probe::report_error(&DeviceStatus(e), "uncaptured device error");
        }));

        let lost = Arc::new(Mutex::new(None));
        let lost_slot = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            let text = format!("{reason:?}: {message}");
            probe::report_error(&DeviceError::Lost(text.clone()), "device lost");
            if let Ok(mut slot) = lost_slot.lock() {
                *slot = Some(text);
            }
        });

        tracing::info!("device: {} [{}]", adapter_info, options.profile);

        Ok(DeviceSession {
            device,
            queue,
            profile: options.profile,
            adapter_info,
            timestamps,
            lost,
            _instance: instance,
        })
    }

    /// Whether compute passes can carry timestamp writes.
    pub fn supports_timestamps(&self) -> bool {
        self.timestamps
    }

    /// Limits the device was created with.
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Run `f` inside a validation + out-of-memory error scope.
    ///
    /// Returns `f`'s value together with the first error the device
    /// raised while it ran, if any.
    pub fn scoped<R>(&self, f: impl FnOnce(&wgpu::Device) -> R) -> (R, Option<DeviceStatus>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(oom).map(DeviceStatus))
    }

    /// Block until `index` has finished executing.
    pub fn wait_for(&self, index: wgpu::SubmissionIndex) -> Result<(), DeviceError> {
        self.device.poll(wgpu::Maintain::wait_for(index));
        self.check_lost()
    }

    /// Block until every submitted command has finished (queue drain).
    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        self.device.poll(wgpu::Maintain::Wait);
        self.check_lost()
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        match self.lost.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(msg) => Err(DeviceError::Lost(msg.clone())),
                None => Ok(()),
            },
            Err(_) => Err(DeviceError::Lost("device-lost flag poisoned".to_string())),
        }
    }
}

impl fmt::Display for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceSession {{ adapter: {}, profile: {}, timestamps: {} }}",
            self.adapter_info, self.profile, self.timestamps
        )
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        tracing::debug!("releasing device session on {}", self.adapter_info.name);
    }
}

// ============================================================
// Selection and limits helpers
// ============================================================

/// Pick one adapter: real hardware first, then virtual/other, then (only
/// if allowed) a CPU rasteriser.
fn select_adapter(adapters: Vec<wgpu::Adapter>, allow_software: bool) -> Option<wgpu::Adapter> {
    let mut ranked: Vec<(u8, wgpu::Adapter)> = adapters
        .into_iter()
        .filter_map(|a| {
            let rank = adapter_rank(a.get_info().device_type, allow_software)?;
            Some((rank, a))
        })
        .collect();
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().next().map(|(_, a)| a)
}

/// Lower is better; `None` means never select.
fn adapter_rank(device_type: wgpu::DeviceType, allow_software: bool) -> Option<u8> {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => Some(0),
        wgpu::DeviceType::IntegratedGpu => Some(1),
        wgpu::DeviceType::VirtualGpu => Some(2),
        wgpu::DeviceType::Other => Some(3),
        wgpu::DeviceType::Cpu if allow_software => Some(4),
        wgpu::DeviceType::Cpu => None,
    }
}

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::Constrained => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

/// Session for device-path unit tests, or `None` (with a note) on a
/// machine with no adapter at all.
#[cfg(test)]
pub(crate) fn test_session() -> Option<DeviceSession> {
    match DeviceSession::open(&DeviceOptions::permissive()) {
        Ok(session) => Some(session),
        Err(e) => {
            eprintln!("[test] no adapter ({e}); skipping");
            None
        }
    }
}

// ============================================================
// Tests
// ============================================================
