//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;
mod stopwatch;

pub use bitmap::Bitmap;
pub use config::ValidatedConfig;
pub use error::BiphaseError;
pub use stopwatch::Stopwatch;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};
