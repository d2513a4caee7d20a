pub mod buffer;
pub mod card;
pub mod output;
pub mod pattern;
pub mod plane;

pub use buffer::FrameBuffer;
pub use card::Card;
pub use output::DisplayTarget;
pub use plane::PlaneCompositor;
