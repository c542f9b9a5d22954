use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("no address found for: {0}")]
    NoAddress(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("handshake timed out: {0}")]
    HandshakeTimeout(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("listen error: {0}")]
    Listen(String),

    #[error("authentication failed ({0}): {1}")]
    Auth(u16, String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("nat table is full")]
    NatFull,

    #[error("liveness error: {0}")]
    Liveness(String),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_carries_status() {
        let e = Error::Auth(407, "missing credentials".to_string());
        assert!(e.to_string().contains("407"));
    }

    #[test]
    fn io_error_roundtrip() {
        let e = Error::Dial("10.0.0.1:80 unreachable".to_string());
        let io: std::io::Error = e.into();
        assert!(io.to_string().contains("unreachable"));
    }
}
