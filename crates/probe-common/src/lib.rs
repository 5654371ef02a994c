mod bump_memlock_rlimit;
mod handler;
pub mod kernel_version;
pub mod program;

pub use bump_memlock_rlimit::bump_memlock_rlimit;
pub use handler::RawEventHandler;
pub use program::{BpfContext, BpfLogLevel, Program, ProgramBuilder, ProgramError};

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub const MAX_SYSCALLS: usize = 512;
