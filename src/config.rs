// config.rs — run configuration.
//
// Defaults describe the reference run: a 1920×1024 image read
// from `original_0.csv`, kernel `filter_image` from the box filter built
// into the binary, 64-wide workgroups sized with the squared-local rule,
// result written to `resultado.csv`. The CLI overrides individual fields.

use std::path::PathBuf;

use crate::gpu::device::DeviceOptions;
use crate::gpu::program::DEFAULT_MAX_SOURCE_BYTES;
use crate::gpu::sizing::Sizing;
use crate::probe::StatusCode;
use crate::store::CsvLimits;

/// What to do when a device operation after kernel creation fails
/// (transfer, bind, dispatch, synchronisation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePolicy {
    /// Report and carry on; the output may be all zeros.
    #[default]
    Continue,
    /// Report and stop with an error.
    Abort,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Kernel source file; `None` runs the built-in box filter.
    pub kernel: Option<PathBuf>,
    pub entry_point: String,
    pub width: usize,
    pub height: usize,
    /// Invocations per workgroup, written into the kernel's `{{LOCAL_SIZE}}`.
    pub local_size: u32,
    pub sizing: Sizing,
    /// Ceiling on kernel source size in bytes.
    pub max_source_bytes: usize,
    pub csv: CsvLimits,
    pub device: DeviceOptions,
    pub policy: DevicePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input: PathBuf::from("original_0.csv"),
            output: PathBuf::from("resultado.csv"),
            kernel: None,
            entry_point: "filter_image".to_string(),
            width: 1920,
            height: 1024,
            local_size: 64,
            sizing: Sizing::SquaredLocal,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            csv: CsvLimits::default(),
            device: DeviceOptions::default(),
            policy: DevicePolicy::Continue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("image dimensions must be non-zero (got {width}×{height})")]
    EmptyImage { width: usize, height: usize },

    #[error("image dimensions {width}×{height} do not fit the kernel's u32 arguments")]
    TooLarge { width: usize, height: usize },

    #[error("local size must be non-zero")]
    ZeroLocalSize,

    #[error("entry point name is empty")]
    EmptyEntryPoint,
}

impl StatusCode for ConfigError {
    fn code(&self) -> i32 {
        match self {
            ConfigError::EmptyImage { .. } => -80,
            ConfigError::TooLarge { .. } => -81,
            ConfigError::ZeroLocalSize => -82,
            ConfigError::EmptyEntryPoint => -83,
        }
    }
}

impl PipelineConfig {
    /// Reject configurations no device run could satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (width, height) = (self.width, self.height);
        if width == 0 || height == 0 {
            return Err(ConfigError::EmptyImage { width, height });
        }
        // The kernel receives width, height and indexes up to width*height
        // as u32.
        let fits = u32::try_from(width).is_ok()
            && u32::try_from(height).is_ok()
            && width
                .checked_mul(height)
                .is_some_and(|n| u32::try_from(n).is_ok());
        if !fits {
            return Err(ConfigError::TooLarge { width, height });
        }
        if self.local_size == 0 {
            return Err(ConfigError::ZeroLocalSize);
        }
        if self.entry_point.is_empty() {
            return Err(ConfigError::EmptyEntryPoint);
        }
        Ok(())
    }

    /// `width * height`.
    pub fn dimension(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}
