use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame body too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Request builder is single-use and was already built")]
    BuilderReused,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
