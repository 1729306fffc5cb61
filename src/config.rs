use std::{fs, path::PathBuf, sync::Arc, time::Duration};
use serde::Deserialize;
use config::Config;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use crate::utils::error::ConfigError;

/// Default listening address when none is configured.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:389";

/// Settings for the `session-server` binary.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Address the server listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Read deadline per connection in milliseconds, 0 for none.
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Write deadline per connection in milliseconds, 0 for none.
    #[serde(default)]
    pub write_timeout_ms: u64,
    /// Whether connections are served over TLS.
    #[serde(default)]
    pub enable_tls: bool,
    /// Path to the PEM certificate chain.
    #[serde(default)]
    pub tls_cert_path: PathBuf,
    /// Path to the PEM (PKCS#8) private key.
    #[serde(default)]
    pub tls_key_path: PathBuf,
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            enable_tls: false,
            tls_cert_path: PathBuf::new(),
            tls_key_path: PathBuf::new(),
        }
    }
}

impl Settings {
    /// Loads the settings from environment variables.
    ///
    /// Environment variables are prefixed with `SESSION_`, for example
    /// `SESSION_BIND_ADDRESS` or `SESSION_READ_TIMEOUT_MS`.
    ///
    /// # Errors
    /// Returns a `ConfigError::Invalid` if the environment cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::Environment::with_prefix("SESSION").try_parsing(true))
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Validates the settings.
    ///
    /// Checks that the bind address has the `host:port` form and, with TLS
    /// enabled, that the certificate and key files exist. Host names are not
    /// resolved here; that happens when the listener binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bind_address(&self.bind_address)?;

        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Builds the rustls configuration from the configured PEM files.
    ///
    /// Returns `None` when TLS is disabled.
    ///
    /// # Errors
    /// Returns a `ConfigError::Invalid` if any part of the TLS setup fails.
    pub fn create_tls_config(&self) -> Result<Option<Arc<RustlsServerConfig>>, ConfigError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path).map_err(|e| {
            ConfigError::Invalid(format!("reading certificate chain {:?}: {}", self.tls_cert_path, e))
        })?;

        let key_der = fs::read(&self.tls_key_path).map_err(|e| {
            ConfigError::Invalid(format!("reading private key {:?}: {}", self.tls_key_path, e))
        })?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| ConfigError::Invalid(format!("parsing certificate chain: {}", e)))?;
        if certs.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "no certificate found in {:?}",
                self.tls_cert_path
            )));
        }

        let key = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| ConfigError::Invalid(format!("parsing private key: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::Invalid(format!(
                "no PKCS#8 private key found in {:?}",
                self.tls_key_path
            )))?;

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(key),
            )
            .map_err(|e| ConfigError::Invalid(format!("building rustls server config: {}", e)))?;

        Ok(Some(Arc::new(config)))
    }
}

/// Accepts `host:port` with a non-empty host (bracketed for IPv6) and a
/// numeric port.
fn check_bind_address(address: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| {
        ConfigError::Invalid(format!("bind_address {:?}: {}", address, reason))
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() || host == "[]" {
        return Err(invalid("missing host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 hosts must be bracketed"));
    }
    port.parse::<u16>()
        .map_err(|e| invalid(&format!("bad port: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.bind_address, DEFAULT_BIND_ADDRESS);
        assert!(settings.read_timeout().is_zero());
        settings.validate().unwrap();
        assert!(settings.create_tls_config().unwrap().is_none());
    }

    #[test]
    fn rejects_unparsable_bind_address() {
        let settings = Settings {
            bind_address: "not an address".into(),
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bind_address_accepts_host_names() {
        for address in ["localhost:389", "ldap.example.com:636", "[::1]:389", "127.0.0.1:0"] {
            let settings = Settings {
                bind_address: address.into(),
                ..Settings::default()
            };
            assert!(settings.validate().is_ok(), "{address} rejected");
        }

        for address in ["", "localhost", ":389", "localhost:", "localhost:ldap", "::1:389"] {
            let settings = Settings {
                bind_address: address.into(),
                ..Settings::default()
            };
            assert!(
                matches!(settings.validate(), Err(ConfigError::Invalid(_))),
                "{address:?} accepted"
            );
        }
    }

    #[test]
    fn tls_requires_existing_files() {
        let settings = Settings {
            enable_tls: true,
            tls_cert_path: PathBuf::from("/nonexistent/cert.pem"),
            tls_key_path: PathBuf::from("/nonexistent/key.pem"),
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
        match settings.create_tls_config() {
            Err(ConfigError::Invalid(msg)) => {
                assert!(msg.starts_with("reading certificate chain"), "{msg}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn timeouts_convert_from_millis() {
        let settings = Settings {
            read_timeout_ms: 50,
            write_timeout_ms: 1500,
            ..Settings::default()
        };
        assert_eq!(settings.read_timeout(), Duration::from_millis(50));
        assert_eq!(settings.write_timeout(), Duration::from_millis(1500));
    }
}
