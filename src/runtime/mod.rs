mod runner;
mod supervisor;

pub use runner::*;
pub use supervisor::*;
