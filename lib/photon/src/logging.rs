pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Level, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal root logger writing to stderr at the given severity.
pub fn terminal_root(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("Failed to construct terminal logger")
}

/// Root logger that swallows everything. Used by tests and as the default
/// when the host application does not supply a logger.
#[inline]
pub fn discard_root() -> Logger {
    Logger::root(Discard, o!())
}

pub use sloggers::types::Severity as RootSeverity;
