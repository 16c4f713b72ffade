// gpu/profiler.rs — device-clock timing of one dispatch.
//
// The compute pass writes two timestamps into a query set: one when the
// pass begins, one when it ends. The dispatch resolves them into a buffer
// in the same command encoder, so by the time the dispatch has been waited
// on the ticks are sitting in device memory. `Profiler::measure` maps them
// back and converts ticks to nanoseconds with the queue's timestamp period.
//
// Timestamps need `Features::TIMESTAMP_QUERY`. Without it the dispatch runs
// untimed and `measure` returns 0, as it does for an event that never
// completed.

use crate::gpu::device::DeviceSession;

/// Number of bytes one resolved timestamp occupies.
const QUERY_SIZE: u64 = wgpu::QUERY_SIZE as u64;

/// Query set plus the buffers needed to read it back.
pub struct TimestampQueries {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    period_ns: f32,
}

impl TimestampQueries {
    /// `None` when the session was opened without timestamp support.
    pub fn new(session: &DeviceSession) -> Option<Self> {
        if !session.supports_timestamps() {
            return None;
        }
        let device = &session.device;
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("kernel timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp resolve"),
            size: 2 * QUERY_SIZE,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp readback"),
            size: 2 * QUERY_SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Some(TimestampQueries {
            query_set,
            resolve,
            readback,
            period_ns: session.queue.get_timestamp_period(),
        })
    }

    /// Timestamp writes for the compute pass: index 0 at begin, 1 at end.
    pub fn pass_writes(&self) -> wgpu::ComputePassTimestampWrites<'_> {
        wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        }
    }

    /// Record the resolve + copy into the read-back buffer. Must follow
    /// the compute pass in the same encoder.
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.resolve_query_set(&self.query_set, 0..2, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.readback, 0, 2 * QUERY_SIZE);
    }
}

/// One submitted dispatch.
///
/// Produced by the dispatcher, consumed by [`Profiler::measure`].
pub struct ExecutionEvent {
    pub(crate) timing: Option<TimestampQueries>,
    pub(crate) completed: bool,
}

impl ExecutionEvent {
    /// Whether the dispatch was waited on to completion.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Whether the dispatch carried timestamp writes.
    pub fn is_timed(&self) -> bool {
        self.timing.is_some()
    }
}

pub struct Profiler;

impl Profiler {
    /// Elapsed device time of the dispatch in nanoseconds.
    ///
    /// Returns 0 when the event is untimed, incomplete or the timestamps
    /// cannot be read.
    pub fn measure(session: &DeviceSession, event: ExecutionEvent) -> u64 {
        if !event.completed {
            return 0;
        }
        let Some(timing) = event.timing else {
            return 0;
        };

        let slice = timing.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        if session.wait_idle().is_err() {
            return 0;
        }
        match rx.try_recv() {
            Ok(Ok(())) => {}
            _ => {
                tracing::warn!("timestamp read-back failed; reporting 0 ns");
                return 0;
            }
        }

        let ticks: [u64; 2] = {
            let mapped = slice.get_mapped_range();
            let q = QUERY_SIZE as usize;
            [
                bytemuck::pod_read_unaligned::<u64>(&mapped[..q]),
                bytemuck::pod_read_unaligned::<u64>(&mapped[q..2 * q]),
            ]
        };
        timing.readback.unmap();
        ticks_to_ns(ticks[0], ticks[1], timing.period_ns)
    }
}

/// Convert a start/end tick pair to nanoseconds. A reversed pair (some
/// drivers reset the counter between passes) reads as 0.
pub fn ticks_to_ns(start: u64, end: u64, period_ns: f32) -> u64 {
    let ticks = end.saturating_sub(start);
    (ticks as f64 * f64::from(period_ns)).round() as u64
}
