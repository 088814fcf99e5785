//! Infrastructure for ClearVolume: device output, synthetic sources and the
//! pipeline service task

pub mod audio;
pub mod service;
pub mod source;

pub use service::{PipelineService, ServiceError, ServiceHandle};
pub use source::{ToneSource, ToneSpec};
