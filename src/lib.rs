pub mod archive;
pub mod audit;
pub mod config;
pub mod docker;
pub mod engine;
pub mod network;
pub mod object_store;
pub mod retention;
pub mod runspec;
pub mod schedule_store;
pub mod scheduler;
pub mod service;
pub mod supervisor;
pub mod volume;

pub mod error;

#[cfg(test)]
mod tests;

pub use error::{CoreError, CoreResult};
pub use service::Service;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber; the container entrypoint calls this once
/// before `Service::boot` so daemon-connection failures are logged rather
/// than only returned.
pub fn init_log(log_level: Level) {
    let mut log_fmt = fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .with_level(true);

    #[cfg(debug_assertions)]
    {
        log_fmt = log_fmt
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true);
    }

    log_fmt.init();
}
