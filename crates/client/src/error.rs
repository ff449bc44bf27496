use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Cipher error: {0}")]
    Cipher(#[from] veiltunnel_cipher::CipherError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
