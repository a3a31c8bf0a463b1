//! Kafka source and sink stages for streams graphs. Positions are [LogPosition]s keyed by
//! topic and partition.
//!
//! [LogPosition]: streams_core::LogPosition

use std::collections::HashMap;

use rdkafka::config::ClientConfig;
use tracing::warn;

/// Consumer group backed [Source](streams_core::Source).
pub mod source;
pub use source::{KafkaSource, KafkaSourceConfig};

/// Batching producer [Sink](streams_core::Sink).
pub mod sink;
pub use sink::{KafkaSink, KafkaSinkConfig};

/// Header holding the topic an envelope was consumed from.
pub const KAFKA_TOPIC_HEADER_KEY: &str = "x-streams-kafka-topic";

const ENV_BROKERS: &str = "STREAMS_KAFKA_BROKERS";
const ENV_SASL_MECHANISM: &str = "STREAMS_KAFKA_SASL_MECHANISM";
const ENV_SASL_USERNAME: &str = "STREAMS_KAFKA_SASL_USERNAME";
const ENV_SASL_PASSWORD: &str = "STREAMS_KAFKA_SASL_PASSWORD";
const ENV_TLS_CA_CERT: &str = "STREAMS_KAFKA_TLS_CA_CERT";
const ENV_TLS_INSECURE_SKIP_VERIFY: &str = "STREAMS_KAFKA_TLS_INSECURE_SKIP_VERIFY";

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<Error> for streams_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Config(msg) => streams_core::Error::Config(msg),
            other => streams_core::Error::Stage(other.to_string()),
        }
    }
}

/// SASL mechanism and credentials used to connect to Kafka.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaSaslAuth {
    Plain { username: String, password: String },
    ScramSha256 { username: String, password: String },
    ScramSha512 { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Applies the TLS and SASL settings to a librdkafka client configuration.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls: Option<TlsConfig>,
    auth: Option<KafkaSaslAuth>,
) {
    let protocol = match (tls.is_some(), auth.is_some()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SSL",
        (false, true) => "SASL_PLAINTEXT",
        (false, false) => "PLAINTEXT",
    };
    client_config.set("security.protocol", protocol);

    if let Some(tls) = tls {
        if tls.insecure_skip_verify {
            warn!(
                "'insecure_skip_verify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = tls.ca_cert {
            client_config.set("ssl.ca.pem", ca_cert);
        }
        if let Some(client_auth) = tls.client_auth {
            client_config
                .set("ssl.certificate.pem", client_auth.client_cert)
                .set("ssl.key.pem", client_auth.client_cert_private_key);
        }
    }

    if let Some(auth) = auth {
        let (mechanism, username, password) = match auth {
            KafkaSaslAuth::Plain { username, password } => ("PLAIN", username, password),
            KafkaSaslAuth::ScramSha256 { username, password } => {
                ("SCRAM-SHA-256", username, password)
            }
            KafkaSaslAuth::ScramSha512 { username, password } => {
                ("SCRAM-SHA-512", username, password)
            }
        };
        client_config
            .set("sasl.mechanisms", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
}

/// Collects the environment into a map, keeping only the variables of this crate.
pub(crate) fn kafka_env(
    env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
) -> HashMap<String, String> {
    env_vars
        .into_iter()
        .map(|(key, val)| (key.into(), val.into()))
        .filter(|(key, _val)| key.starts_with("STREAMS_KAFKA_"))
        .collect()
}

pub(crate) fn required<'a>(env: &'a HashMap<String, String>, var: &str) -> Result<&'a str> {
    env.get(var)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))
}

pub(crate) fn parse_optional<T>(env: &HashMap<String, String>, var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env.get(var)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Invalid {var} value {v:?}: {e}")))
        })
        .transpose()
}

/// Splits a comma separated list, dropping blank items.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn brokers_from_env(env: &HashMap<String, String>) -> Result<Vec<String>> {
    Ok(split_list(required(env, ENV_BROKERS)?))
}

pub(crate) fn auth_from_env(env: &HashMap<String, String>) -> Result<Option<KafkaSaslAuth>> {
    let Some(mechanism) = env.get(ENV_SASL_MECHANISM) else {
        return Ok(None);
    };
    let username = required(env, ENV_SASL_USERNAME)?.to_string();
    let password = required(env, ENV_SASL_PASSWORD)?.to_string();
    match mechanism.trim().to_ascii_uppercase().as_str() {
        "PLAIN" => Ok(Some(KafkaSaslAuth::Plain { username, password })),
        "SCRAM-SHA-256" => Ok(Some(KafkaSaslAuth::ScramSha256 { username, password })),
        "SCRAM-SHA-512" => Ok(Some(KafkaSaslAuth::ScramSha512 { username, password })),
        other => Err(Error::Config(format!(
            "Unsupported {ENV_SASL_MECHANISM} value {other:?}"
        ))),
    }
}

pub(crate) fn tls_from_env(env: &HashMap<String, String>) -> Result<Option<TlsConfig>> {
    let ca_cert = env.get(ENV_TLS_CA_CERT).cloned();
    let insecure_skip_verify = parse_optional::<bool>(env, ENV_TLS_INSECURE_SKIP_VERIFY)?;
    if ca_cert.is_none() && insecure_skip_verify.is_none() {
        return Ok(None);
    }
    Ok(Some(TlsConfig {
        insecure_skip_verify: insecure_skip_verify.unwrap_or(false),
        ca_cert,
        client_auth: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_protocol() {
        let cases = [
            (None, None, "PLAINTEXT"),
            (
                None,
                Some(KafkaSaslAuth::Plain {
                    username: "u".to_string(),
                    password: "p".to_string(),
                }),
                "SASL_PLAINTEXT",
            ),
            (
                Some(TlsConfig {
                    insecure_skip_verify: true,
                    ca_cert: None,
                    client_auth: None,
                }),
                None,
                "SSL",
            ),
        ];

        for (tls, auth, expected) in cases {
            let mut config = ClientConfig::new();
            update_auth_config(&mut config, tls, auth);
            assert_eq!(config.get("security.protocol"), Some(expected));
        }
    }

    #[test]
    fn test_sasl_settings() {
        let mut config = ClientConfig::new();
        update_auth_config(
            &mut config,
            Some(TlsConfig {
                insecure_skip_verify: false,
                ca_cert: Some("ca".to_string()),
                client_auth: Some(TlsClientAuthCerts {
                    client_cert: "cert".to_string(),
                    client_cert_private_key: "key".to_string(),
                }),
            }),
            Some(KafkaSaslAuth::ScramSha512 {
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
        );

        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("ssl.ca.pem"), Some("ca"));
        assert_eq!(config.get("ssl.key.pem"), Some("key"));
        assert_eq!(config.get("enable.ssl.certificate.verification"), None);
    }

    #[test]
    fn test_auth_from_env() {
        let env = kafka_env([
            ("STREAMS_KAFKA_SASL_MECHANISM", "scram-sha-256"),
            ("STREAMS_KAFKA_SASL_USERNAME", "user"),
            ("STREAMS_KAFKA_SASL_PASSWORD", "secret"),
            ("OTHER", "ignored"),
        ]);
        assert!(!env.contains_key("OTHER"));
        assert_eq!(
            auth_from_env(&env).unwrap(),
            Some(KafkaSaslAuth::ScramSha256 {
                username: "user".to_string(),
                password: "secret".to_string()
            })
        );

        let env = kafka_env([("STREAMS_KAFKA_SASL_MECHANISM", "PLAIN")]);
        assert!(
            matches!(auth_from_env(&env), Err(Error::Config(msg)) if msg.contains("STREAMS_KAFKA_SASL_USERNAME"))
        );

        let env = kafka_env(Vec::<(String, String)>::new());
        assert_eq!(auth_from_env(&env).unwrap(), None);
    }

    #[test]
    fn test_tls_from_env() {
        let env = kafka_env([("STREAMS_KAFKA_TLS_INSECURE_SKIP_VERIFY", "true")]);
        assert_eq!(
            tls_from_env(&env).unwrap(),
            Some(TlsConfig {
                insecure_skip_verify: true,
                ca_cert: None,
                client_auth: None,
            })
        );

        let env = kafka_env([("STREAMS_KAFKA_TLS_INSECURE_SKIP_VERIFY", "maybe")]);
        assert!(tls_from_env(&env).is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn test_error_conversion() {
        let err: streams_core::Error = Error::Config("bad".to_string()).into();
        assert!(matches!(err, streams_core::Error::Config(msg) if msg == "bad"));

        let err: streams_core::Error = Error::Kafka("down".to_string()).into();
        assert!(matches!(err, streams_core::Error::Stage(msg) if msg == "Kafka - down"));
    }
}
