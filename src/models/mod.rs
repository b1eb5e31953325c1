//! Task wrappers around an exported model
//!
//! [`Model`] owns the deploy config and the backend; [`Detector`],
//! [`Segmenter`] and [`RealtimeSegmenter`] interpret its raw outputs.

pub mod det;
pub mod model;
pub mod rseg;
pub mod seg;

pub use det::{BoundingBox, Detection, Detector};
pub use model::{Model, ModelFiles};
pub use rseg::{AlphaMatte, RealtimeSegmenter};
pub use seg::{SegmentationResult, Segmenter};
