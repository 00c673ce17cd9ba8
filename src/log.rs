//! Transport log shim
//!
//! The transport library logs through a process-wide hook, not through the
//! `tracing` machinery this crate uses for its own diagnostics. This module
//! owns that hook: a single installable sink plus a minimum level,
//! last-writer-wins. The default sink prints
//! `level | file:line | message` to standard output at warning-and-above.
//!
//! Installation is optional; endpoints work without ever touching it.

use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;

/// Severity of a transport library log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Notice,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Sink signature: level, source file, source line, message
pub type LogHandler = dyn Fn(LogLevel, &str, u32, &str) + Send + Sync;

struct Sink {
    handler: Arc<LogHandler>,
    level: LogLevel,
}

lazy_static! {
    static ref SINK: RwLock<Sink> = RwLock::new(Sink {
        handler: Arc::new(default_log_handler),
        level: LogLevel::Warning,
    });
}

/// Default sink: prints `level | file:line | message` to standard output
pub fn default_log_handler(level: LogLevel, file: &str, line: u32, message: &str) {
    println!("{} | {}:{} | {}", level, file, line, message);
}

/// Install a process-wide sink and minimum level for transport library
/// logs. Last writer wins; this is deliberately NOT per-endpoint.
pub fn set_log_handler<F>(handler: F, level: LogLevel)
where
    F: Fn(LogLevel, &str, u32, &str) + Send + Sync + 'static,
{
    *SINK.write() = Sink {
        handler: Arc::new(handler),
        level,
    };
}

/// Route one transport library log line through the installed sink.
/// Lines below the installed level are dropped.
pub fn transport_log(level: LogLevel, file: &str, line: u32, message: &str) {
    let (handler, minimum) = {
        let sink = SINK.read();
        (sink.handler.clone(), sink.level)
    };
    if level >= minimum {
        handler(level, file, line, message);
    }
}
