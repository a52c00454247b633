//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for epoxide.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EpoxideError(pub String);

impl EpoxideError {
    /// Constructs an error from any printable message.
    pub fn msg(m: impl ToString) -> Self {
        EpoxideError(m.to_string())
    }
}

impl fmt::Display for EpoxideError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for EpoxideError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `EpoxideError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for EpoxideError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                EpoxideError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
