//! The ambient error kinds layered over [`ptcompile::CompileError`] — everything that can go
//! wrong outside the compiler core: parsing, provider resolution, map setup, attachment.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("parse error: {0}")]
    Parse(#[from] ptir::ParseError),

    #[error("probe {probe:?}: no provider registered for namespace {namespace:?}")]
    UnknownProvider { probe: String, namespace: String },

    #[error("compiling probe {probe:?}: {source}")]
    Compile {
        probe: String,
        #[source]
        source: ptcompile::CompileError,
    },

    #[error("map setup failed for {map:?}: {reason}")]
    MapSetup { map: String, reason: String },

    #[error("attach failed for probe {probe:?}: {reason}")]
    Attach { probe: String, reason: String },

    #[error("probe {probe:?}: glob {pattern:?} matched no kernel symbols")]
    NoSymbolsMatched { probe: String, pattern: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
