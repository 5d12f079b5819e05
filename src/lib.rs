//! pstats-bridge core library: turns `pstats` dumps into viewer JSON inside
//! supervised, time-bounded worker processes.

mod codec;
mod config;
mod handler;
pub mod marshal;
mod platform;
mod report;
mod runtime;
mod stats_cmd;

pub use codec::*;
pub use config::*;
pub use handler::*;
pub use marshal::MarshalValue;
pub use platform::*;
pub use report::*;
pub use runtime::*;
pub use stats_cmd::*;
