pub mod cli;
pub mod config;
pub mod error;
pub mod run;

pub use cli::{Cli, Command};
pub use error::{exit_code, Error};

/// Installs `env_logger` the way `engine/logging` sets up the teacher's
/// logger: level from `RUST_LOG`, defaulting to `info` so a bare `wess`
/// invocation isn't silent.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
