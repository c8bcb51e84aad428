//! CUDA CUPTI PC sampling
//!
//! CUPTI (CUDA Profiling Tools Interface) samples the program counter of
//! active warps together with the reason each warp was stalled.

pub mod attribution;
pub mod bindings;
pub mod collector;
pub mod configure;
pub mod cubin;
pub mod replay;
pub mod stall_reasons;
