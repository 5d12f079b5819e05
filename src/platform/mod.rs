mod error;
mod storage;

pub use error::*;
pub use storage::*;
