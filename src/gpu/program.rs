// gpu/program.rs — compile kernel source into an executable pipeline.
//
// KERNEL CONTRACT
// ───────────────
// The source is WGSL. It must provide a `@compute` entry point (default
// name `filter_image`; `filter` is a reserved word in WGSL), take its
// workgroup size from the `{{LOCAL_SIZE}}` placeholder, and bind its
// arguments at these slots:
//
//   const LOCAL_SIZE: u32 = {{LOCAL_SIZE}}u;
//
//   @group(0) @binding(0) var<storage, read>       input:  array<i32>;
//   @group(0) @binding(1) var<storage, read_write> output: array<i32>;
//   @group(0) @binding(2) var<uniform>             height: u32;
//   @group(0) @binding(3) var<uniform>             width:  u32;
//
//   @compute @workgroup_size({{LOCAL_SIZE}})
//   fn filter_image(@builtin(global_invocation_id) gid: vec3<u32>, ...) { ... }
//
// naga does not accept `override` expressions inside @workgroup_size(), so
// the host writes the configured group size into the source text before
// compiling. A source without the placeholder is rejected: its group size
// would silently disagree with the dispatch sizing.
//
// BUILD LOG
// ─────────
// A failed build returns the whole diagnostic text in one `String`: every
// compilation message (with line:column when known) followed by the
// device's validation error. wgpu collects both internally; there is no
// size query to make first.

use std::fs::File;
use std::io::{self, Read};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use crate::gpu::buffer::AccessMode;
use crate::gpu::device::{DeviceSession, DeviceStatus};
use crate::probe::StatusCode;

/// Token replaced by the configured workgroup size before compilation.
pub const LOCAL_SIZE_PLACEHOLDER: &str = "{{LOCAL_SIZE}}";

/// The 3×3 box filter shipped with the crate, used when no kernel file is
/// configured.
pub const DEFAULT_KERNEL: &str = include_str!("../shaders/filter.wgsl");

/// Default ceiling for kernel source size (1 MiB).
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 0x10_0000;

/// Kind of one positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Storage buffer with the given access mode.
    Buffer(AccessMode),
    /// `u32` passed as a uniform.
    Scalar,
}

/// The positional signature every kernel implements:
/// `(input, output, height, width)`.
pub const KERNEL_SIGNATURE: [(&str, ArgKind); 4] = [
    ("input", ArgKind::Buffer(AccessMode::ReadOnly)),
    ("output", ArgKind::Buffer(AccessMode::ReadWrite)),
    ("height", ArgKind::Scalar),
    ("width", ArgKind::Scalar),
];

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("failed to read kernel source {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("kernel source {} exceeds {limit} bytes", path.display())]
    SourceTooLarge { path: PathBuf, limit: usize },

    #[error("kernel build failed:\n{log}")]
    Compile { log: String },

    #[error("kernel entry point `{entry_point}` could not be created:\n{log}")]
    KernelNotFound { entry_point: String, log: String },

    #[error("kernel source has no {placeholder} placeholder for its workgroup size")]
    MissingLocalSize { placeholder: &'static str },
}

impl StatusCode for ProgramError {
    fn code(&self) -> i32 {
        match self {
            ProgramError::Io { .. } => -30,
            ProgramError::SourceTooLarge { .. } => -31,
            ProgramError::Compile { .. } => -32,
            ProgramError::KernelNotFound { .. } => -33,
            ProgramError::MissingLocalSize { .. } => -34,
        }
    }
}

/// A built kernel, ready to dispatch on the session that built it.
pub struct CompiledProgram {
    pub module: wgpu::ShaderModule,
    pub layout: wgpu::BindGroupLayout,
    pub pipeline: wgpu::ComputePipeline,
    pub entry_point: String,
    pub local_size: u32,
}

/// Read kernel source in full, refusing files over `max_bytes`.
pub fn load_source(path: impl AsRef<Path>, max_bytes: usize) -> Result<String, ProgramError> {
    let path = path.as_ref();
    let io_err = |source: io::Error| ProgramError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut source = String::new();
    file.take(max_bytes as u64 + 1)
        .read_to_string(&mut source)
        .map_err(io_err)?;
    if source.len() > max_bytes {
        return Err(ProgramError::SourceTooLarge {
            path: path.to_path_buf(),
            limit: max_bytes,
        });
    }
    Ok(source)
}

pub struct ProgramBuilder;

impl ProgramBuilder {
    /// Compile `source` and create the pipeline for `entry_point`.
    ///
    /// # Errors
    /// `Compile` with a non-empty log if the source does not build;
    /// `KernelNotFound` if the entry point is missing or does not match
    /// the kernel signature.
    pub fn build(
        session: &DeviceSession,
        source: &str,
        entry_point: &str,
        local_size: u32,
    ) -> Result<CompiledProgram, ProgramError> {
        let source = specialize(source, local_size)?;
        let (module, status) = session.scoped(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("kernel"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        let info = pollster::block_on(module.get_compilation_info());
        let failed = status.is_some()
            || info
                .messages
                .iter()
                .any(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error));
        if failed {
            return Err(ProgramError::Compile {
                log: build_log(&info, status.as_ref()),
            });
        }
        for m in &info.messages {
            tracing::warn!("kernel: {}", format_message(m));
        }

        let layout = kernel_layout(&session.device);
        let pipeline_layout = session
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("kernel pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let (pipeline, status) = session.scoped(|device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        });
        if let Some(status) = status {
            return Err(ProgramError::KernelNotFound {
                entry_point: entry_point.to_string(),
                log: status.to_string(),
            });
        }

        tracing::info!("built kernel `{entry_point}` (local size {local_size})");
        Ok(CompiledProgram {
            module,
            layout,
            pipeline,
            entry_point: entry_point.to_string(),
            local_size,
        })
    }
}

/// Write `local_size` into every `{{LOCAL_SIZE}}` token of `source`.
pub fn specialize(source: &str, local_size: u32) -> Result<String, ProgramError> {
    if !source.contains(LOCAL_SIZE_PLACEHOLDER) {
        return Err(ProgramError::MissingLocalSize {
            placeholder: LOCAL_SIZE_PLACEHOLDER,
        });
    }
    Ok(source.replace(LOCAL_SIZE_PLACEHOLDER, &local_size.to_string()))
}

/// Bind group layout mirroring [`KERNEL_SIGNATURE`].
fn kernel_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let entries: Vec<wgpu::BindGroupLayoutEntry> = KERNEL_SIGNATURE
        .iter()
        .enumerate()
        .map(|(slot, (_, kind))| wgpu::BindGroupLayoutEntry {
            binding: slot as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: binding_type(*kind),
            count: None,
        })
        .collect();
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("kernel arguments"),
        entries: &entries,
    })
}

fn binding_type(kind: ArgKind) -> wgpu::BindingType {
    match kind {
        ArgKind::Buffer(mode) => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: mode == AccessMode::ReadOnly,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        ArgKind::Scalar => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: NonZeroU64::new(std::mem::size_of::<u32>() as u64),
        },
    }
}

/// Assemble the full diagnostic text. Never empty.
fn build_log(info: &wgpu::CompilationInfo, status: Option<&DeviceStatus>) -> String {
    let mut lines: Vec<String> = info.messages.iter().map(format_message).collect();
    if let Some(status) = status {
        lines.push(status.to_string());
    }
    if lines.is_empty() {
        lines.push("shader module creation failed without diagnostics".to_string());
    }
    lines.join("\n")
}

fn format_message(m: &wgpu::CompilationMessage) -> String {
    let kind = match m.message_type {
        wgpu::CompilationMessageType::Error => "error",
        wgpu::CompilationMessageType::Warning => "warning",
        wgpu::CompilationMessageType::Info => "info",
    };
    match &m.location {
        Some(loc) => format!("{kind} at {}:{}: {}", loc.line_number, loc.line_position, m.message),
        None => format!("{kind}: {}", m.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::test_session;

    const IDENTITY: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<i32>;
@group(0) @binding(1) var<storage, read_write> output: array<i32>;
@group(0) @binding(2) var<uniform> height: u32;
@group(0) @binding(3) var<uniform> width: u32;

@compute @workgroup_size({{LOCAL_SIZE}})
fn filter_image(@builtin(global_invocation_id) gid: vec3<u32>) {
    if gid.x < width * height {
        output[gid.x] = input[gid.x];
    }
}
"#;

    #[test]
    fn test_signature_order() {
        let names: Vec<&str> = KERNEL_SIGNATURE.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["input", "output", "height", "width"]);
        assert_eq!(KERNEL_SIGNATURE[0].1, ArgKind::Buffer(AccessMode::ReadOnly));
        assert_eq!(KERNEL_SIGNATURE[1].1, ArgKind::Buffer(AccessMode::ReadWrite));
    }

    #[test]
    fn test_scalar_binding_is_sized_uniform() {
        match binding_type(ArgKind::Scalar) {
            wgpu::BindingType::Buffer { ty, min_binding_size, .. } => {
                assert_eq!(ty, wgpu::BufferBindingType::Uniform);
                assert_eq!(min_binding_size.map(|n| n.get()), Some(4));
            }
            other => panic!("unexpected binding type {other:?}"),
        }
    }

    #[test]
    fn test_load_source_missing_file() {
        let err = load_source("/nonexistent/filter.wgsl", DEFAULT_MAX_SOURCE_BYTES).unwrap_err();
        assert!(matches!(err, ProgramError::Io { .. }));
    }

    #[test]
    fn test_load_source_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.wgsl");
        std::fs::write(&path, "x".repeat(33)).unwrap();
        let err = load_source(&path, 32).unwrap_err();
        assert!(matches!(err, ProgramError::SourceTooLarge { limit: 32, .. }));
        assert_eq!(load_source(&path, 33).unwrap().len(), 33);
    }

    #[test]
    fn test_empty_build_log_is_never_empty() {
        let info = wgpu::CompilationInfo { messages: Vec::new() };
        assert!(!build_log(&info, None).is_empty());
    }

    #[test]
    fn test_specialize_writes_every_placeholder() {
        let src = specialize("@workgroup_size({{LOCAL_SIZE}}) const L = {{LOCAL_SIZE}}u;", 128).unwrap();
        assert_eq!(src, "@workgroup_size(128) const L = 128u;");
    }

    #[test]
    fn test_specialize_rejects_fixed_workgroup_size() {
        let fixed = IDENTITY.replace(LOCAL_SIZE_PLACEHOLDER, "64");
        let err = specialize(&fixed, 64).unwrap_err();
        assert!(matches!(err, ProgramError::MissingLocalSize { .. }));
        assert_eq!(err.code(), -34);
    }

    #[test]
    fn test_default_kernel_follows_contract() {
        let src = specialize(DEFAULT_KERNEL, 64).unwrap();
        assert!(src.contains("@workgroup_size(64)"));
        assert!(src.contains("fn filter_image("));
        assert!(!src.contains("override"));
    }

    // ---- Device path: any adapter, software included --------------------

    #[test]
    fn test_build_identity_kernel() {
        let Some(session) = test_session() else { return };
        let program = ProgramBuilder::build(&session, IDENTITY, "filter_image", 64).unwrap();
        assert_eq!(program.entry_point, "filter_image");
        assert_eq!(program.local_size, 64);
    }

    #[test]
    fn test_build_default_kernel_at_several_sizes() {
        let Some(session) = test_session() else { return };
        for local_size in [1, 32, 64, 256] {
            let program = ProgramBuilder::build(&session, DEFAULT_KERNEL, "filter_image", local_size)
                .unwrap_or_else(|e| panic!("local size {local_size}: {e}"));
            assert_eq!(program.local_size, local_size);
        }
    }

    #[test]
    fn test_build_syntax_error_surfaces_log() {
        let Some(session) = test_session() else { return };
        let broken = IDENTITY.replace("output[gid.x] = input[gid.x];", "output[gid.x] = ;");
        match ProgramBuilder::build(&session, &broken, "filter_image", 64) {
            Err(ProgramError::Compile { log }) => assert!(!log.trim().is_empty()),
            Err(other) => panic!("expected Compile, got {other}"),
            Ok(_) => panic!("broken source compiled"),
        }
    }

    #[test]
    fn test_missing_entry_point() {
        let Some(session) = test_session() else { return };
        match ProgramBuilder::build(&session, IDENTITY, "blur", 64) {
            Err(ProgramError::KernelNotFound { entry_point, log }) => {
                assert_eq!(entry_point, "blur");
                assert!(!log.is_empty());
            }
            Err(other) => panic!("expected KernelNotFound, got {other}"),
            Ok(_) => panic!("pipeline created for a missing entry point"),
        }
    }
}
