//! Post-processing worker
//!
//! Frames and their alpha mattes are handed to a [`PostProcessor`] running
//! on a dedicated thread. [`PostProcessWorkerManager`] numbers each request,
//! caps the number in flight and resolves every caller with the reply that
//! carries its id.

pub mod manager;
pub mod processor;
pub mod protocol;

pub use manager::{PostProcessWorkerManager, DEFAULT_MAX_QUEUE_SIZE};
pub use processor::{Compositor, PostProcessor};
pub use protocol::{Background, FrameData, InitOptions, LoadModels, OutputFormat, Reply, Request, RunPostProcess};
