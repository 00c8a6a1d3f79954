// Shared error type for loading and validating the data model.

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
