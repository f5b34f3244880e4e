pub mod build;
pub mod ids;
pub mod study;

pub use build::*;
pub use ids::*;
pub use study::*;
