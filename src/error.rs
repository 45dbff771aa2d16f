use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a whole measurement load
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("could not open measurement file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not read header row: {0}")]
    HeaderRead(#[source] std::io::Error),

    #[error("header row was empty")]
    EmptyHeader,

    #[error("delimiter {0:?} is not a single ASCII character")]
    InvalidDelimiter(char),
}

/// Tracking system construction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("invalid tracker parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("beacon layout needs at least {required} beacons, got {actual}")]
    TooFewBeacons { required: usize, actual: usize },

    #[error("invalid camera parameters: {0}")]
    InvalidCamera(String),
}

/// Rejected optimizer requests
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("parameter vector is empty")]
    EmptyParameters,

    #[error("interpolation point count {npt} outside [{min}, {max}]")]
    InterpolationCount { npt: usize, min: usize, max: usize },

    #[error("trust region radii must be positive and finite (begin={begin}, end={end})")]
    InvalidRadius { begin: f64, end: f64 },

    #[error("evaluation budget must be at least 1")]
    ZeroBudget,
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}
