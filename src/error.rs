use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("device {name} not found")]
    DeviceNotFound { name: String },

    #[error("{worker} is not running")]
    NotRunning { worker: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
