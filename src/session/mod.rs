mod handle;
mod registry;

pub use handle::*;
pub use registry::*;
