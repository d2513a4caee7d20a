pub mod format;
pub mod stream;

pub use format::{AcceptedFormat, PixelFormat};
pub use stream::CaptureStream;
