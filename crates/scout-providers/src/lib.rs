pub mod client;
pub mod generate;
pub mod search;

pub use client::*;
pub use generate::*;
pub use search::*;
