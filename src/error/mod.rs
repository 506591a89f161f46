use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Integrity error: {context}: expected sha256 {expected}, got {actual}")]
    Integrity {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Security error: {0}")]
    Security(String),

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Phase error: {0}")]
    Phase(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("No envy.lua manifest found in this directory or any ancestor")]
    ManifestNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap this error for propagation out of a Lua hook. The sandbox
    /// raises these as Lua errors so spec code sees a plain message.
    pub fn into_lua(self) -> mlua::Error {
        match self {
            Error::Lua(e) => e,
            other => mlua::Error::external(other.to_string()),
        }
    }
}
