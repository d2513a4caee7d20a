//! The event-driven coordinator and its seams.
//!
//! The coordinator is generic over two narrow traits so the ownership
//! state machine can be driven by fake backends in tests and by the real
//! V4L2/KMS devices in production.

pub mod coordinator;
pub mod scanout;
pub mod slots;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use scanout::KmsScanout;
pub use slots::{SlotState, SlotTable};

use crate::capture::CaptureStream;
use crate::error::Result;

/// A source of completed capture buffers, keyed by pool index.
pub trait FrameSource {
    /// Non-blocking reclaim of one completed buffer. `Ok(None)` is the
    /// normal "try later" condition, never an error.
    fn retrieve(&mut self) -> Result<Option<u32>>;

    /// Hand a buffer back for the next capture cycle.
    fn submit(&mut self, index: u32) -> Result<()>;

    /// Disable capture. Must be safe when streaming never started.
    fn stop(&mut self) -> Result<()>;
}

/// A scanout backend accepting per-stream buffer binds.
pub trait ScanoutSink {
    /// Bind buffer `index` of stream `stream` to that stream's plane.
    fn present(&mut self, stream: usize, index: u32) -> Result<()>;

    /// Drain pending display events, returning the number of scanout
    /// completions observed.
    fn completions(&mut self) -> Result<u32>;

    /// Reapply the display configuration that preceded the pipeline.
    fn restore(&mut self) -> Result<()>;
}

impl FrameSource for CaptureStream {
    fn retrieve(&mut self) -> Result<Option<u32>> {
        CaptureStream::retrieve(self)
    }

    fn submit(&mut self, index: u32) -> Result<()> {
        self.resubmit(index)
    }

    fn stop(&mut self) -> Result<()> {
        CaptureStream::stop(self)
    }
}
