use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage a frame-level failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    F0,
    Spectral,
    Aperiodicity,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::F0 => "f0 extraction",
            Stage::Spectral => "spectral analysis",
            Stage::Aperiodicity => "aperiodicity analysis",
            Stage::Synthesis => "synthesis",
        })
    }
}

/// Flat classification of [`Error`], ignoring any stage context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    InvalidState,
    Unsupported,
    ThreadCreationFailed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument '{name}': {message}")]
    InvalidArgument { name: &'static str, message: String },

    #[error("out of memory allocating {what} ({requested} elements)")]
    OutOfMemory { what: &'static str, requested: usize },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("failed to start worker pool: {0}")]
    ThreadCreationFailed(#[from] rayon::ThreadPoolBuildError),

    #[error("{stage} failed at frame {frame}: {source}")]
    Stage {
        stage: Stage,
        frame: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid_arg(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    pub fn out_of_memory(what: &'static str, requested: usize) -> Self {
        Self::OutOfMemory { what, requested }
    }

    /// Attaches stage and frame context. Already-wrapped errors keep their
    /// innermost context.
    pub fn at(self, stage: Stage, frame: usize) -> Self {
        match self {
            err @ Error::Stage { .. } => err,
            err => Error::Stage {
                stage,
                frame,
                source: Box::new(err),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::ThreadCreationFailed(_) => ErrorKind::ThreadCreationFailed,
            Error::Stage { source, .. } => source.kind(),
        }
    }
}

/// Checks that a rate or frequency-like value is finite and strictly positive.
pub(crate) fn ensure_positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::invalid_arg(name, format!("must be positive, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_context_preserves_kind() {
        let err = Error::out_of_memory("envelope", 1 << 40).at(Stage::Spectral, 12);
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        let msg = err.to_string();
        assert!(msg.contains("spectral analysis"));
        assert!(msg.contains("frame 12"));
    }

    #[test]
    fn test_stage_context_is_not_rewrapped() {
        let err = Error::invalid_arg("f0", "negative")
            .at(Stage::F0, 3)
            .at(Stage::Aperiodicity, 9);
        match err {
            Error::Stage { stage, frame, .. } => {
                assert_eq!(stage, Stage::F0);
                assert_eq!(frame, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_ensure_positive() {
        assert!(ensure_positive("rate", 44100.0).is_ok());
        assert!(ensure_positive("rate", 0.0).is_err());
        assert!(ensure_positive("rate", f64::NAN).is_err());
    }
}
