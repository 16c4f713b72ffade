// gpu/dispatch.rs — bind kernel arguments, enqueue the kernel, wait.
//
// ARGUMENT BINDING
// ────────────────
// Arguments are positional, in the order of `KERNEL_SIGNATURE`:
//
//   0 input  buffer (read-only)
//   1 output buffer (read-write)
//   2 height u32
//   3 width  u32
//
// `KernelArgs::set_arg` checks one slot at a time and returns its own
// result, so a caller can report each bind failure independently and still
// decide whether to go on. The bind group itself is only created at
// dispatch, from whatever slots were filled.
//
// DISPATCH
// ────────
// One compute pass, `dispatch_workgroups(num_groups, 1, 1)`, bracketed by
// timestamp writes when the device supports them. After submitting, the
// host blocks on that submission (the completion event) and then drains
// the queue. Only then is the event handed to the profiler and the output
// buffer read back.

use wgpu::util::DeviceExt;

use crate::gpu::buffer::{AccessMode, DeviceBuffer};
use crate::gpu::device::{DeviceError, DeviceSession, DeviceStatus};
use crate::gpu::profiler::{ExecutionEvent, TimestampQueries};
use crate::gpu::program::{ArgKind, CompiledProgram, KERNEL_SIGNATURE};
use crate::gpu::sizing::WorkDecomposition;
use crate::probe::StatusCode;

const SLOTS: usize = KERNEL_SIGNATURE.len();

/// Value for one kernel argument slot.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(&'a DeviceBuffer),
    Scalar(u32),
}

impl KernelArg<'_> {
    fn describe(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::Scalar(_) => "scalar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("argument index {index} out of range (kernel takes {slots})")]
    SlotOutOfRange { index: usize, slots: usize },

    #[error("argument {index} (`{name}`) expects {expected:?}, got a {found}")]
    KindMismatch {
        index: usize,
        name: &'static str,
        expected: ArgKind,
        found: &'static str,
    },

    #[error("argument {index} (`{name}`) expects a {expected:?} buffer, got {found:?}")]
    AccessMismatch {
        index: usize,
        name: &'static str,
        expected: AccessMode,
        found: AccessMode,
    },

    #[error("argument {index} (`{name}`) was never bound")]
    Unbound { index: usize, name: &'static str },
}

impl StatusCode for BindError {
    fn code(&self) -> i32 {
        match self {
            BindError::SlotOutOfRange { .. } => -60,
            BindError::KindMismatch { .. } => -61,
            BindError::AccessMismatch { .. } => -62,
            BindError::Unbound { .. } => -63,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("decomposition local size {decomposition} does not match the program's {program}")]
    LocalSizeMismatch { program: u32, decomposition: u32 },

    #[error("local size {local_size} exceeds the device limit of {max}")]
    WorkgroupTooLarge { local_size: u32, max: u32 },

    #[error("{num_groups} workgroups exceed the device limit of {max} per dimension")]
    TooManyGroups { num_groups: u32, max: u32 },

    #[error("kernel enqueue rejected by the device: {0}")]
    Rejected(DeviceStatus),

    #[error("waiting for the kernel failed: {0}")]
    Sync(#[from] DeviceError),
}

impl StatusCode for DispatchError {
    fn code(&self) -> i32 {
        match self {
            DispatchError::Bind(e) => e.code(),
            DispatchError::LocalSizeMismatch { .. } => -70,
            DispatchError::WorkgroupTooLarge { .. } => -71,
            DispatchError::TooManyGroups { .. } => -72,
            DispatchError::Rejected(_) => -73,
            DispatchError::Sync(e) => e.code(),
        }
    }
}

/// The positional argument list of one kernel invocation.
#[derive(Debug, Default)]
pub struct KernelArgs<'a> {
    slots: [Option<KernelArg<'a>>; SLOTS],
}

impl<'a> KernelArgs<'a> {
    pub fn new() -> Self {
        KernelArgs { slots: [None; SLOTS] }
    }

    /// Bind `arg` to slot `index`. A failed bind leaves the slot as it was.
    pub fn set_arg(&mut self, index: usize, arg: KernelArg<'a>) -> Result<(), BindError> {
        let (name, expected) = *KERNEL_SIGNATURE
            .get(index)
            .ok_or(BindError::SlotOutOfRange { index, slots: SLOTS })?;
        match (expected, &arg) {
            (ArgKind::Buffer(mode), KernelArg::Buffer(buf)) if buf.mode() != mode => {
                return Err(BindError::AccessMismatch {
                    index,
                    name,
                    expected: mode,
                    found: buf.mode(),
                });
            }
            (ArgKind::Buffer(_), KernelArg::Buffer(_)) | (ArgKind::Scalar, KernelArg::Scalar(_)) => {}
            _ => {
                return Err(BindError::KindMismatch {
                    index,
                    name,
                    expected,
                    found: arg.describe(),
                });
            }
        }
        self.slots[index] = Some(arg);
        Ok(())
    }

    /// First unbound slot, if any.
    pub fn missing(&self) -> Option<BindError> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.is_none().then(|| BindError::Unbound {
                index,
                name: KERNEL_SIGNATURE[index].0,
            })
        })
    }

    pub fn get(&self, index: usize) -> Option<&KernelArg<'a>> {
        self.slots.get(index).and_then(Option::as_ref)
    }
}

pub struct Dispatcher;

impl Dispatcher {
    /// Enqueue `program` over `work` with `args`, then block until the
    /// kernel has completed and the queue has drained.
    pub fn dispatch(
        session: &DeviceSession,
        program: &CompiledProgram,
        args: &KernelArgs<'_>,
        work: &WorkDecomposition,
    ) -> Result<ExecutionEvent, DispatchError> {
        if work.local_size != program.local_size {
            return Err(DispatchError::LocalSizeMismatch {
                program: program.local_size,
                decomposition: work.local_size,
            });
        }
        check_limits(&session.limits(), work)?;
        if let Some(missing) = args.missing() {
            return Err(missing.into());
        }

        let device = &session.device;

        // Scalars travel as 4-byte uniform buffers; the vector keeps them
        // alive until the bind group has been created.
        let scalar_buffers: Vec<Option<wgpu::Buffer>> = args
            .slots
            .iter()
            .map(|slot| match slot {
                Some(KernelArg::Scalar(v)) => {
                    Some(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("kernel scalar"),
                        contents: bytemuck::bytes_of(v),
                        usage: wgpu::BufferUsages::UNIFORM,
                    }))
                }
                _ => None,
            })
            .collect();

        let timing = TimestampQueries::new(session);

        let (submission, status) = session.scoped(|device| {
            let entries: Vec<wgpu::BindGroupEntry> = args
                .slots
                .iter()
                .zip(&scalar_buffers)
                .enumerate()
                .filter_map(|(binding, (slot, scalar))| {
                    let resource = match (slot, scalar) {
                        (Some(KernelArg::Buffer(buf)), _) => buf.raw().as_entire_binding(),
                        (Some(KernelArg::Scalar(_)), Some(scalar)) => scalar.as_entire_binding(),
                        _ => return None,
                    };
                    Some(wgpu::BindGroupEntry {
                        binding: binding as u32,
                        resource,
                    })
                })
                .collect();
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("kernel arguments"),
                layout: &program.layout,
                entries: &entries,
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel dispatch"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(program.entry_point.as_str()),
                    timestamp_writes: timing.as_ref().map(TimestampQueries::pass_writes),
                });
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(work.num_groups, 1, 1);
            }
            if let Some(t) = &timing {
                t.resolve(&mut encoder);
            }
            session.queue.submit(std::iter::once(encoder.finish()))
        });
        if let Some(status) = status {
            return Err(DispatchError::Rejected(status));
        }

        session.wait_for(submission)?;
        session.wait_idle()?;

        tracing::debug!(
            "dispatched `{}`: {} groups × {} invocations",
            program.entry_point,
            work.num_groups,
            work.local_size
        );
        Ok(ExecutionEvent {
            timing,
            completed: true,
        })
    }
}

/// Validate a decomposition against device limits.
pub fn check_limits(limits: &wgpu::Limits, work: &WorkDecomposition) -> Result<(), DispatchError> {
    let max_local = limits
        .max_compute_invocations_per_workgroup
        .min(limits.max_compute_workgroup_size_x);
    if work.local_size > max_local {
        return Err(DispatchError::WorkgroupTooLarge {
            local_size: work.local_size,
            max: max_local,
        });
    }
    if work.num_groups > limits.max_compute_workgroups_per_dimension {
        return Err(DispatchError::TooManyGroups {
            num_groups: work.num_groups,
            max: limits.max_compute_workgroups_per_dimension,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::sizing::{Covering, SizingRule, SquaredLocal};

    #[test]
    fn test_scalar_slots_bind() {
        let mut args = KernelArgs::new();
        assert!(args.set_arg(2, KernelArg::Scalar(1024)).is_ok());
        assert!(args.set_arg(3, KernelArg::Scalar(1920)).is_ok());
        assert!(matches!(args.get(2), Some(KernelArg::Scalar(1024))));
    }

    #[test]
    fn test_out_of_range_slot() {
        let mut args = KernelArgs::new();
        assert_eq!(
            args.set_arg(4, KernelArg::Scalar(0)),
            Err(BindError::SlotOutOfRange { index: 4, slots: 4 })
        );
    }

    #[test]
    fn test_scalar_into_buffer_slot_rejected() {
        let mut args = KernelArgs::new();
        let err = args.set_arg(0, KernelArg::Scalar(7)).unwrap_err();
        assert!(matches!(err, BindError::KindMismatch { index: 0, name: "input", .. }));
        assert!(args.get(0).is_none());
    }

    #[test]
    fn test_missing_reports_first_unbound_slot() {
        let mut args = KernelArgs::new();
        args.set_arg(2, KernelArg::Scalar(1)).unwrap();
        assert_eq!(args.missing(), Some(BindError::Unbound { index: 0, name: "input" }));
    }

    #[test]
    fn test_bind_failures_are_independent() {
        // A failed bind does not stop later binds from succeeding.
        let mut args = KernelArgs::new();
        let results = [
            args.set_arg(0, KernelArg::Scalar(0)),
            args.set_arg(9, KernelArg::Scalar(0)),
            args.set_arg(2, KernelArg::Scalar(4)),
            args.set_arg(3, KernelArg::Scalar(4)),
        ];
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 2);
        assert!(args.get(2).is_some() && args.get(3).is_some());
    }

    #[test]
    fn test_check_limits_default_device() {
        let limits = wgpu::Limits::default();
        let reference = SquaredLocal.decompose(1920 * 1024, 64).unwrap();
        assert!(check_limits(&limits, &reference).is_ok());
        let covering = Covering.decompose(1920 * 1024, 64).unwrap();
        assert!(check_limits(&limits, &covering).is_ok());
    }

    #[test]
    fn test_check_limits_rejects_large_workgroup() {
        let limits = wgpu::Limits::default();
        let work = Covering.decompose(4096, 512).unwrap();
        assert!(matches!(
            check_limits(&limits, &work),
            Err(DispatchError::WorkgroupTooLarge { local_size: 512, .. })
        ));
    }

    #[test]
    fn test_check_limits_rejects_too_many_groups() {
        let limits = wgpu::Limits::default();
        // 8 Mi elements, one per invocation at local size 64 → 131 072 groups.
        let work = Covering.decompose(8 << 20, 64).unwrap();
        assert!(matches!(check_limits(&limits, &work), Err(DispatchError::TooManyGroups { .. })));
    }
}
