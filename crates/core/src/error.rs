use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Malformed address record")]
    MalformedAddress,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
