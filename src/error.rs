//! Typed errors for the proxy lifecycle engine

use std::fmt;

/// Errors surfaced by providers, proxies and the manager
#[derive(Debug)]
pub enum Error {
    /// No mesh provider could be resolved for a proxy config
    ProviderNotFound(String),
    /// A target id is unknown to the provider that was asked about it
    TargetNotFound(String),
    /// No usable upstream port could be derived for a container
    NoPortFound(String),
    /// A listener was requested for a port key the proxy does not have
    ProxyPortNotFound(String),
    /// Configuration failed to parse or validate
    InvalidConfig(String),
    /// Underlying I/O failure
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ProviderNotFound(name) => write!(f, "proxy provider not found: {}", name),
            Error::TargetNotFound(id) => write!(f, "target not found: {}", id),
            Error::NoPortFound(id) => write!(f, "no port found in container: {}", id),
            Error::ProxyPortNotFound(key) => write!(f, "proxy port not found: {}", key),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::ProviderNotFound("ts1".into()).to_string(),
            "proxy provider not found: ts1"
        );
        assert_eq!(
            Error::TargetNotFound("abc".into()).to_string(),
            "target not found: abc"
        );
        assert_eq!(
            Error::ProxyPortNotFound("443/https".into()).to_string(),
            "proxy port not found: 443/https"
        );
    }

    #[test]
    fn test_io_source() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
