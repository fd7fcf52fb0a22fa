mod build;
mod stages;

pub use build::*;
pub use stages::*;
