//! Display ownership for the bridge: the `DisplaySurface` seam to the
//! device SDK, text pagination, and the arbiter that serializes render
//! jobs onto the one physical display.

mod arbiter;
mod bitmap;
pub mod mock;
mod paginate;
mod surface;

pub use arbiter::{ArbiterConfig, DisplayArbiter, DisplayStatus};
pub use bitmap::solid_black_frame;
pub use paginate::{paginate, split_text, CHUNK_SIZE};
pub use surface::DisplaySurface;
