mod bootstrap;
mod console;
mod dirs;
mod error;
mod expect;
mod health;
mod launcher;
mod lifecycle;
mod poller;
mod qemu;
mod startup_config;
mod state;
#[cfg(unix)]
mod supervisor;
#[cfg(test)]
mod testing;

pub use bootstrap::*;
pub use console::*;
pub use self::dirs::*;
pub use error::*;
pub use expect::*;
pub use health::*;
pub use launcher::*;
pub use lifecycle::*;
pub use poller::*;
pub use qemu::*;
pub use startup_config::*;
pub use state::*;
#[cfg(unix)]
pub use supervisor::*;
