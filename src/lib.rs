// gpufilter: single-pass GPU image filtering over CSV images.
//
// Host side of a compute-kernel run: read an integer image, hand it to a
// WGSL kernel through wgpu, time the dispatch on the device clock and
// write the result back out.

pub mod config;
pub mod gpu;
pub mod image;
pub mod pipeline;
pub mod probe;
pub mod store;
