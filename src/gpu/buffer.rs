// gpu/buffer.rs — device buffers paired 1:1 with host images.
//
// LIFECYCLE
// ─────────
//   allocate → upload → (kernel runs) → download → release
//
// Every transfer is blocking: `upload` returns once the data is resident on
// the device, `download` once the host image holds the device contents.
// A buffer is released only after the pipeline has drained the queue, so no
// in-flight command can still reference it.
//
// READ-BACK
// ─────────
// Storage buffers cannot be mapped directly. `download` copies into a
// transient `MAP_READ | COPY_DST` staging buffer, waits for that
// submission, maps it and copies the bytes into the host image. The map
// callback fires during the blocking poll; if it has not fired once the
// poll returns, the device was lost and the read-back is reported as
// failed instead of blocking forever.

use crate::gpu::device::{DeviceError, DeviceSession, DeviceStatus};
use crate::image::{Image, Pixel};
use crate::probe::StatusCode;

/// How the kernel may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    fn usage(self) -> wgpu::BufferUsages {
        match self {
            AccessMode::ReadOnly => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            AccessMode::ReadWrite => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
        }
    }
}

/// A device-resident region with a declared access mode.
///
/// `byte_size` always equals the byte size of the paired host image.
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    mode: AccessMode,
    byte_size: u64,
    label: String,
}

impl DeviceBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("allocating `{label}` ({byte_size} bytes) failed: {status}")]
    Allocation {
        label: String,
        byte_size: u64,
        status: DeviceStatus,
    },

    #[error("`{label}` is {buffer} bytes but the host image is {host} bytes")]
    SizeMismatch { label: String, buffer: u64, host: u64 },

    #[error("`{label}` is read-only on the device and cannot be read back")]
    NotReadable { label: String },

    #[error("transfer to `{label}` rejected by the device: {status}")]
    Transfer { label: String, status: DeviceStatus },

    #[error("mapping `{label}` for read-back failed: {reason}")]
    Map { label: String, reason: String },

    #[error(transparent)]
    Sync(#[from] DeviceError),
}

impl StatusCode for BufferError {
    fn code(&self) -> i32 {
        match self {
            BufferError::Allocation { .. } => -50,
            BufferError::SizeMismatch { .. } => -51,
            BufferError::NotReadable { .. } => -52,
            BufferError::Transfer { .. } => -53,
            BufferError::Map { .. } => -54,
            BufferError::Sync(e) => e.code(),
        }
    }
}

/// Allocation and host↔device transfers.
pub struct BufferManager;

impl BufferManager {
    /// Allocate `byte_size` bytes of device memory.
    pub fn allocate(
        session: &DeviceSession,
        label: &str,
        byte_size: u64,
        mode: AccessMode,
    ) -> Result<DeviceBuffer, BufferError> {
        let (buffer, status) = session.scoped(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: byte_size,
                usage: mode.usage(),
                mapped_at_creation: false,
            })
        });
        if let Some(status) = status {
            return Err(BufferError::Allocation {
                label: label.to_string(),
                byte_size,
                status,
            });
        }
        tracing::debug!("allocated `{label}`: {byte_size} bytes, {mode:?}");
        Ok(DeviceBuffer {
            buffer,
            mode,
            byte_size,
            label: label.to_string(),
        })
    }

    /// Allocate a buffer sized for `img`.
    pub fn allocate_for<T: Pixel>(
        session: &DeviceSession,
        label: &str,
        img: &Image<T>,
        mode: AccessMode,
    ) -> Result<DeviceBuffer, BufferError> {
        Self::allocate(session, label, img.byte_len(), mode)
    }

    /// Blocking host → device copy of the whole image.
    pub fn upload<T: Pixel>(
        session: &DeviceSession,
        buffer: &DeviceBuffer,
        img: &Image<T>,
    ) -> Result<(), BufferError> {
        check_size(buffer, img.byte_len())?;

        let ((), status) = session.scoped(|_| {
            session.queue.write_buffer(&buffer.buffer, 0, img.as_bytes());
        });
        if let Some(status) = status {
            return Err(BufferError::Transfer {
                label: buffer.label.clone(),
                status,
            });
        }

        // `write_buffer` is staged until the next submit; an empty submit
        // flushes it and gives us an index to block on.
        let index = session.queue.submit(std::iter::empty());
        session.wait_for(index)?;
        Ok(())
    }

    /// Blocking device → host copy of the whole buffer into `img`.
    pub fn download<T: Pixel>(
        session: &DeviceSession,
        buffer: &DeviceBuffer,
        img: &mut Image<T>,
    ) -> Result<(), BufferError> {
        check_size(buffer, img.byte_len())?;
        if buffer.mode == AccessMode::ReadOnly {
            return Err(BufferError::NotReadable {
                label: buffer.label.clone(),
            });
        }

        let (staging, status) = session.scoped(|device| {
            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("read-back staging"),
                size: buffer.byte_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read-back"),
            });
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, buffer.byte_size);
            session.queue.submit(std::iter::once(encoder.finish()));
            staging
        });
        if let Some(status) = status {
            return Err(BufferError::Transfer {
                label: buffer.label.clone(),
                status,
            });
        }

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // The receiver outlives the poll below; a send failure only
            // means we already gave up on this map.
            let _ = tx.send(r);
        });
        session.wait_idle()?;

        match rx.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BufferError::Map {
                    label: buffer.label.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(BufferError::Map {
                    label: buffer.label.clone(),
                    reason: "map callback did not fire".to_string(),
                })
            }
        }

        {
            let mapped = slice.get_mapped_range();
            let dst: &mut [u8] = bytemuck::cast_slice_mut(img.as_mut_slice());
            dst.copy_from_slice(&mapped);
        }
        staging.unmap();
        Ok(())
    }

    /// Free the buffer's device memory.
    ///
    /// Callers must have drained the queue first; nothing here waits.
    pub fn release(buffer: DeviceBuffer) {
        tracing::debug!("releasing `{}`", buffer.label);
        buffer.buffer.destroy();
    }
}

fn check_size(buffer: &DeviceBuffer, host: u64) -> Result<(), BufferError> {
    if buffer.byte_size != host {
        return Err(BufferError::SizeMismatch {
            label: buffer.label.clone(),
            buffer: buffer.byte_size,
            host,
        });
    }
    Ok(())
}
