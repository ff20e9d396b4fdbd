//! Error types for svox

use thiserror::Error;

/// Main error type for the library
#[derive(Debug, Error)]
pub enum Error {
    /// An input failed validation before any computation was dispatched
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("refine error: {0}")]
    Refine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }
}

/// Fail with [`Error::Precondition`] unless `cond` holds.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::core::Error::precondition(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;

#[cfg(test)]
mod tests {
    use super::*;

    fn check(n: usize) -> crate::core::Result<usize> {
        ensure!(n > 0, "n must be positive, got {}", n);
        Ok(n)
    }

    #[test]
    fn test_ensure_macro() {
        assert_eq!(check(3).unwrap(), 3);
        let err = check(0).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(err.to_string(), "precondition failed: n must be positive, got 0");
    }

    #[test]
    fn test_io_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
