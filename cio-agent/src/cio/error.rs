use thiserror::Error;

#[derive(Error, Debug)]
pub enum CioError {
    #[error("vdisk '{0}' not found")]
    VdiskNotFound(String),

    #[error("vdisk '{0}' already exists")]
    VdiskExists(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("cio command failed: {0}")]
    CommandFailed(String),

    #[error("failed to parse cio output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CioError>;
