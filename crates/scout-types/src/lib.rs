pub mod events;
pub mod pipeline;

pub use events::*;
pub use pipeline::*;
