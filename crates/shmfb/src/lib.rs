//! Zero-copy frame buffer transport over SysV shared memory.
//!
//! A producer publishes frames through a [`Publisher`]; consumers attach the
//! control segment, read the current frame buffer id from it and attach that
//! segment read-only.

pub mod command;
pub mod control;
pub mod convert;
pub mod error;
pub mod frame;
pub mod gc;
pub mod listing;
pub mod output;
pub mod pixel;
pub mod segment;
pub mod selftest;
pub mod sink;
pub mod view;

pub use control::{ControlBlock, ControlHandle};
pub use error::{Result, ShmError};
pub use frame::{FrameBuffer, FrameBufferHandle};
pub use gc::SweepOutcome;
pub use listing::{lister_for, SegmentInfo, SegmentLister};
pub use output::Publisher;
pub use segment::Segment;
pub use sink::{MessageSink, StderrSink};
pub use view::{HeaderKey, ShmView};
