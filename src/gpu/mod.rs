// gpu/mod.rs — wgpu orchestration layer.
//
// One session, one kernel, one dispatch:
//
//   device    adapter discovery, device + queue, error scopes, waits
//   program   WGSL source → compiled module → compute pipeline
//   buffer    device buffers paired with host images, blocking transfers
//   sizing    workgroup count for a 1-D dispatch
//   dispatch  positional argument binding, submission, completion
//   profiler  device timestamps around the dispatch
//
// Nothing here decides whether an error is fatal. Every call returns its
// own `Result`; the pipeline reports it through the probe and applies the
// run's policy.

pub mod buffer;
pub mod device;
pub mod dispatch;
pub mod profiler;
pub mod program;
pub mod sizing;
