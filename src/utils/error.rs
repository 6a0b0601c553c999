//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for biphase.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BiphaseError(pub String);

impl BiphaseError {
    /// Builds an error from anything that can be displayed.
    pub fn msg(m: impl ToString) -> Self {
        BiphaseError(m.to_string())
    }
}

impl fmt::Display for BiphaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `BiphaseError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for BiphaseError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                BiphaseError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(bincode::error::EncodeError);
impl_from_error!(bincode::error::DecodeError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = BiphaseError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = BiphaseError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_msg_impl() {
        let e = BiphaseError::msg("cannot send to closed channel");
        assert!(e.0.contains("closed channel"));
    }
}
