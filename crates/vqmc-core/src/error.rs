use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the dispatch layer. Nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid time string: {text:?}")]
    InvalidDuration { text: String },

    #[error("invalid unit of time: {unit:?}")]
    UnknownUnit { unit: String },

    /// Experiment directory collision without `force`.
    #[error("could not create experiment {}: directory already exists", path.display())]
    DirectoryExists { path: PathBuf },

    #[error("unknown dispatch backend: {name:?}")]
    UnknownBackend { name: String },

    /// A config value that would break the line it is written into.
    #[error("invalid value for {field}: {value:?}")]
    InvalidConfig { field: &'static str, value: String },

    #[error("refusing to dispatch an empty command")]
    EmptyCommand,

    #[error("working directory does not exist: {}", path.display())]
    MissingWorkingDirectory { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
