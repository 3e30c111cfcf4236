//! Server and capture configuration

use crate::constants::{DEFAULT_PORT, MAX_PORT, MIN_PORT};
use crate::error::Error;
use crate::protocol::Encoding;

/// What the capture backend should record.
///
/// Zero / `None` fields mean "use the endpoint's default"; the backend
/// resolves them into a concrete [`crate::protocol::AudioFormat`] when the
/// stream opens.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Endpoint id from `--list-endpoint`, or `"default"`
    pub endpoint_id: String,
    pub encoding: Option<Encoding>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            endpoint_id: "default".to_string(),
            encoding: None,
            channels: 0,
            sample_rate: 0,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.channels != 0 && !(1..=8).contains(&self.channels) {
            return Err(Error::Config(format!(
                "Channels must be between 1 and 8, got {}",
                self.channels
            )));
        }
        if self.sample_rate != 0 && !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "Sample rate must be between 8000 and 192000 Hz, got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Parsed `--bind` value: `[host][:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// `None` when the host part is empty and a default address should be
    /// discovered
    pub host: Option<String>,
    pub port: u16,
}

pub fn parse_bind_spec(spec: &str) -> Result<BindSpec, Error> {
    let (host, port) = match spec.find(':') {
        None => (spec, DEFAULT_PORT),
        Some(pos) => {
            let port_str = &spec[pos + 1..];
            if port_str.is_empty() {
                return Err(Error::Config("Port number cannot be empty".to_string()));
            }
            let port: u64 = port_str
                .parse()
                .map_err(|_| Error::Config(format!("Invalid port number: '{port_str}'")))?;
            if !(MIN_PORT as u64..=MAX_PORT as u64).contains(&port) {
                return Err(Error::Config(format!(
                    "Port must be between {MIN_PORT} and {MAX_PORT}"
                )));
            }
            (&spec[..pos], port as u16)
        }
    };

    let host = if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    };
    Ok(BindSpec { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_only() {
        let spec = parse_bind_spec("1.2.3.4").unwrap();
        assert_eq!(spec.host.as_deref(), Some("1.2.3.4"));
        assert_eq!(spec.port, DEFAULT_PORT);
    }

    #[test]
    fn test_host_and_port() {
        let spec = parse_bind_spec("192.168.1.5:9000").unwrap();
        assert_eq!(spec.host.as_deref(), Some("192.168.1.5"));
        assert_eq!(spec.port, 9000);
    }

    #[test]
    fn test_port_only() {
        let spec = parse_bind_spec(":9000").unwrap();
        assert_eq!(spec.host, None);
        assert_eq!(spec.port, 9000);
    }

    #[test]
    fn test_empty_port() {
        let err = parse_bind_spec(":").unwrap_err();
        assert_eq!(err.to_string(), "Port number cannot be empty");
    }

    #[test]
    fn test_port_out_of_range() {
        let err = parse_bind_spec(":99999").unwrap_err();
        assert_eq!(err.to_string(), "Port must be between 1 and 65535");
        let err = parse_bind_spec(":0").unwrap_err();
        assert_eq!(err.to_string(), "Port must be between 1 and 65535");
    }

    #[test]
    fn test_port_not_a_number() {
        let err = parse_bind_spec(":abc").unwrap_err();
        assert_eq!(err.to_string(), "Invalid port number: 'abc'");
    }

    #[test]
    fn test_capture_config_validation() {
        assert!(CaptureConfig::default().validate().is_ok());

        let config = CaptureConfig {
            channels: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CaptureConfig {
            sample_rate: 4_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CaptureConfig {
            channels: 2,
            sample_rate: 48_000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
