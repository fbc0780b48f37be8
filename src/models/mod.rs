pub mod common;
pub mod invoice;
pub mod queue;

pub use common::*;
pub use invoice::*;
pub use queue::*;
