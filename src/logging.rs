//! Global logger setup.

use std::io;

use slog::{slog_o, Drain, Logger, Never};
use slog_mozlog_json::MozLogJson;

use crate::error::{ProxyError, ProxyResult};

/// Installs the global logger: MozLog JSON lines on stdout by default, a
/// colored terminal format when human-readable logs are requested. Level
/// filtering follows `RUST_LOG` in both cases.
pub fn init_logging(json: bool) -> ProxyResult<()> {
    let logger = if json {
        mozlog_logger()?
    } else {
        terminal_logger()
    };
    // cancel_reset keeps the logger installed after the guard drops;
    // reset_logging swaps in a discard logger at shutdown instead.
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
    Ok(())
}

pub fn reset_logging() {
    let logger = Logger::root(slog::Discard, slog_o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}

fn mozlog_logger() -> ProxyResult<Logger> {
    let hostname = hostname::get()?
        .into_string()
        .map_err(|_| ProxyError::internal("hostname is not valid UTF-8"))?;

    let drain = MozLogJson::new(io::stdout())
        .logger_name(format!(
            "{}-{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
        .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
        .hostname(hostname)
        .build()
        .fuse();
    Ok(async_root(drain))
}

fn terminal_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    async_root(drain)
}

/// Env-filtered asynchronous pipeline shared by both output formats.
fn async_root<D>(drain: D) -> Logger
where
    D: Drain<Ok = (), Err = Never> + Send + 'static,
{
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog_o!())
}
