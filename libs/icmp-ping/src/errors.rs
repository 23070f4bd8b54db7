use std::net::Ipv4Addr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Ping job for '{ip}' is already running")]
    AlreadyRunning { ip: Ipv4Addr },
    #[error("reply collector for '{ip}' went away")]
    CollectorGone { ip: Ipv4Addr },
}

pub type Result<T> = std::result::Result<T, Error>;
