#![warn(rust_2018_idioms)]

#[macro_use]
extern crate slog_scope;

pub mod durations;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod querycost;
pub mod server;
pub mod settings;
pub mod signals;
