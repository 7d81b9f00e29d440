// Error types for the wheelbase runtime

/// Runtime error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport setup failed on {addr}: {source}")]
    TransportSetup {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Malformed command frame: {0}")]
    MalformedFrame(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
