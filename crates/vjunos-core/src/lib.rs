mod config;
mod error;
mod pattern;
mod script;

pub use config::*;
pub use error::*;
pub use pattern::*;
pub use script::*;
