pub mod mart;
pub mod warehouse;

pub use mart::*;
pub use warehouse::*;
