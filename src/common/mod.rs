mod config;
mod error;
mod flags;
mod types;

pub use config::*;
pub use error::*;
pub use flags::*;
pub use types::*;
