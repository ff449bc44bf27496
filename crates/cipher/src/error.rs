use thiserror::Error;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Obfuscation error: {0}")]
    Obfs(String),
}

pub type Result<T> = std::result::Result<T, CipherError>;
