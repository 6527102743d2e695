// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic MQTT connection settings implementations

use std::env::{self, VarError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// All the settings required to establish an MQTT connection.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct ConnectionSettings {
    /// Client identifier. May be empty when `clean_start` is true, in which
    /// case the broker assigns one.
    #[builder(default)]
    pub(crate) client_id: String,
    /// FQDN of the host to connect to
    pub(crate) hostname: String,
    /// TCP port to connect to the host on
    #[builder(default = "8883")]
    pub(crate) tcp_port: u16,
    /// Max time between communications
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Session Expiry Interval
    #[builder(default = "Duration::from_secs(3600)")]
    pub(crate) session_expiry: Duration,
    /// Connection timeout
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) connection_timeout: Duration,
    /// Clean start
    #[builder(default = "false")]
    pub(crate) clean_start: bool,
    /// Username for MQTT
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Path to a file containing the MQTT password
    #[builder(default = "None")]
    pub(crate) password_file: Option<String>,
    /// Path to a SAT token file to be used for enhanced auth
    #[builder(default = "None")]
    pub(crate) sat_file: Option<String>,
    /// TLS negotiation enabled
    #[builder(default = "true")]
    pub(crate) use_tls: bool,
    /// Path to a PEM file used to validate server identity
    #[builder(default = "None")]
    pub(crate) ca_file: Option<String>,
    /// Path to a PEM file used to establish X509 client authentication
    #[builder(default = "None")]
    pub(crate) cert_file: Option<String>,
    /// Path to a file containing a key used to establish X509 client authentication
    #[builder(default = "None")]
    pub(crate) key_file: Option<String>,
    /// Path to a file containing the password used to decrypt the key
    #[builder(default = "None")]
    pub(crate) key_password_file: Option<String>,
}

impl ConnectionSettings {
    /// Client identifier (may be empty until the broker assigns one).
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Hostname of the broker.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// TCP port of the broker.
    #[must_use]
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Clean start flag requested for the first connection.
    #[must_use]
    pub fn clean_start(&self) -> bool {
        self.clean_start
    }

    /// Session expiry interval requested from the broker.
    #[must_use]
    pub fn session_expiry(&self) -> Duration {
        self.session_expiry
    }

    /// Keep alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Path to the SAT token file, if SAT auth is configured.
    #[must_use]
    pub fn sat_file(&self) -> Option<&str> {
        self.sat_file.as_deref()
    }
}

impl ConnectionSettingsBuilder {
    /// Initialize the [`ConnectionSettingsBuilder`] from environment variables.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment
    /// variables are present but invalid.
    pub fn from_environment() -> Result<Self, String> {
        let client_id = string_from_environment("EDGELINK_MQTT_CLIENT_ID")?;
        let hostname = string_from_environment("EDGELINK_BROKER_HOSTNAME")?;
        let tcp_port = string_from_environment("EDGELINK_BROKER_TCP_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("EDGELINK_BROKER_TCP_PORT: {e}"))?;
        let keep_alive = string_from_environment("EDGELINK_MQTT_KEEP_ALIVE")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("EDGELINK_MQTT_KEEP_ALIVE: {e}"))?;
        let session_expiry = string_from_environment("EDGELINK_MQTT_SESSION_EXPIRY")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("EDGELINK_MQTT_SESSION_EXPIRY: {e}"))?;
        let clean_start = string_from_environment("EDGELINK_MQTT_CLEAN_START")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("EDGELINK_MQTT_CLEAN_START: {e}"))?;
        let use_tls = string_from_environment("EDGELINK_MQTT_USE_TLS")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("EDGELINK_MQTT_USE_TLS: {e}"))?;
        let username = Some(string_from_environment("EDGELINK_MQTT_USERNAME")?);
        let password_file = Some(string_from_environment("EDGELINK_MQTT_PASSWORD_FILE")?);
        let sat_file = Some(string_from_environment("EDGELINK_SAT_FILE")?);
        let ca_file = Some(string_from_environment("EDGELINK_TLS_CA_FILE")?);
        let cert_file = Some(string_from_environment("EDGELINK_TLS_CERT_FILE")?);
        let key_file = Some(string_from_environment("EDGELINK_TLS_KEY_FILE")?);
        let key_password_file = Some(string_from_environment("EDGELINK_TLS_KEY_PASSWORD_FILE")?);

        // Missing required values are warnings rather than errors so that the
        // application can still fill them in through the builder before build()
        if client_id.is_none() {
            log::warn!("EDGELINK_MQTT_CLIENT_ID is not set in environment");
        }
        if hostname.is_none() {
            log::warn!("EDGELINK_BROKER_HOSTNAME is not set in environment");
        }
        if sat_file.as_ref().is_some_and(Option::is_some)
            && password_file.as_ref().is_some_and(Option::is_some)
        {
            log::warn!(
                "EDGELINK_SAT_FILE and EDGELINK_MQTT_PASSWORD_FILE are both set in environment. Only one should be used."
            );
        }

        Ok(Self {
            client_id,
            hostname,
            tcp_port,
            keep_alive,
            session_expiry,
            connection_timeout: Some(Duration::from_secs(30)),
            clean_start,
            username,
            password_file,
            sat_file,
            use_tls,
            ca_file,
            cert_file,
            key_file,
            key_password_file,
        })
    }

    /// Initialize the [`ConnectionSettingsBuilder`] from a connection string of
    /// `Name=Value;` pairs.
    ///
    /// Recognized names: `HostName`, `TcpPort`, `ClientId`, `KeepAlive`
    /// (seconds), `SessionExpiry` (seconds), `CleanStart`, `UseTls`,
    /// `Username`, `PasswordFile`, `SatAuthFile`, `CaFile`, `CertFile`,
    /// `KeyFile`, `KeyPasswordFile`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if the connection string is
    /// malformed, a value fails to parse, or a name is not recognized.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, String> {
        let mut builder = Self::default();
        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Expected Name=Value pair, found '{pair}'"))?;
            match name {
                "HostName" => builder = builder.hostname(value),
                "TcpPort" => {
                    builder = builder
                        .tcp_port(value.parse::<u16>().map_err(|e| format!("TcpPort: {e}"))?);
                }
                "ClientId" => builder = builder.client_id(value),
                "KeepAlive" => {
                    builder = builder.keep_alive(Duration::from_secs(
                        value
                            .parse::<u32>()
                            .map(u64::from)
                            .map_err(|e| format!("KeepAlive: {e}"))?,
                    ));
                }
                "SessionExpiry" => {
                    builder = builder.session_expiry(Duration::from_secs(
                        value
                            .parse::<u32>()
                            .map(u64::from)
                            .map_err(|e| format!("SessionExpiry: {e}"))?,
                    ));
                }
                "CleanStart" => {
                    builder = builder
                        .clean_start(value.parse::<bool>().map_err(|e| format!("CleanStart: {e}"))?);
                }
                "UseTls" => {
                    builder =
                        builder.use_tls(value.parse::<bool>().map_err(|e| format!("UseTls: {e}"))?);
                }
                "Username" => builder = builder.username(Some(value.to_string())),
                "PasswordFile" => builder = builder.password_file(Some(value.to_string())),
                "SatAuthFile" => builder = builder.sat_file(Some(value.to_string())),
                "CaFile" => builder = builder.ca_file(Some(value.to_string())),
                "CertFile" => builder = builder.cert_file(Some(value.to_string())),
                "KeyFile" => builder = builder.key_file(Some(value.to_string())),
                "KeyPasswordFile" => builder = builder.key_password_file(Some(value.to_string())),
                other => return Err(format!("Unrecognized connection string name '{other}'")),
            }
        }
        Ok(builder)
    }

    /// Construct a builder from a deployment file mount.
    ///
    /// The mount directory named by the `EDGELINK_CONFIGMAP_MOUNT_PATH`
    /// environment variable contains one file per setting:
    /// `BROKER_TARGET_ADDRESS` (`<hostname>:<port>`), `BROKER_USE_TLS`, and
    /// optionally `EDGELINK_MQTT_CLIENT_ID`. A SAT token path and CA trust
    /// bundle path are taken from `BROKER_SAT_MOUNT_PATH` and
    /// `BROKER_TLS_TRUST_BUNDLE_CACERT_MOUNT_PATH` respectively.
    ///
    /// # Errors
    /// Returns a `String` describing the error if the mount path does not
    /// exist, a file cannot be read, or a value fails to parse.
    pub fn from_file_mount() -> Result<Self, String> {
        let (client_id, hostname, tcp_port, use_tls) = {
            match string_from_environment("EDGELINK_CONFIGMAP_MOUNT_PATH")? {
                Some(s) => {
                    let mount = PathBuf::from(&s);
                    if !mount.as_path().exists() {
                        return Err(format!("Config map path does not exist: {s}"));
                    }
                    let (hostname, tcp_port) = {
                        match string_from_configmap_file(&mount, "BROKER_TARGET_ADDRESS")? {
                            Some(target_address) => {
                                let (hostname, tcp_port) = target_address.split_once(':').ok_or(
                                    format!(
                                        "BROKER_TARGET_ADDRESS is malformed. Expected format <hostname>:<port>. Found: {target_address}"
                                    ),
                                )?;
                                (
                                    Some(hostname.to_string()),
                                    Some(tcp_port.parse::<u16>().map_err(|e| {
                                        format!(
                                            "Cannot parse MQTT port from BROKER_TARGET_ADDRESS: {e}"
                                        )
                                    })?),
                                )
                            }
                            None => (None, None),
                        }
                    };
                    let client_id = string_from_configmap_file(&mount, "EDGELINK_MQTT_CLIENT_ID")?;
                    let use_tls = string_from_configmap_file(&mount, "BROKER_USE_TLS")?
                        .map(|v| v.parse::<bool>())
                        .transpose()
                        .map_err(|e| format!("BROKER_USE_TLS: {e}"))?;
                    (client_id, hostname, tcp_port, use_tls)
                }
                None => {
                    log::warn!("EDGELINK_CONFIGMAP_MOUNT_PATH is not set in environment");
                    (None, None, None, None)
                }
            }
        };

        let sat_file = Some(string_from_environment("BROKER_SAT_MOUNT_PATH")?);
        let ca_file = Some(string_from_environment(
            "BROKER_TLS_TRUST_BUNDLE_CACERT_MOUNT_PATH",
        )?);

        if hostname.is_none() || tcp_port.is_none() {
            log::warn!("BROKER_TARGET_ADDRESS is not set in configmap mount");
        }

        Ok(Self {
            client_id,
            hostname,
            tcp_port,
            keep_alive: Some(Duration::from_secs(60)),
            session_expiry: Some(Duration::from_secs(3600)),
            connection_timeout: Some(Duration::from_secs(30)),
            clean_start: Some(false),
            username: None,
            password_file: None,
            sat_file,
            use_tls,
            ca_file,
            cert_file: None,
            key_file: None,
            key_password_file: None,
        })
    }

    /// Validate the MQTT Connection Settings.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `hostname` is empty
    /// - `client_id` is empty and `clean_start` is false
    /// - `sat_file` is used together with `password_file`
    /// - `key_file` is Some and `cert_file` is None or empty
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("Host name cannot be empty".to_string());
            }
        }
        let client_id_empty = self.client_id.as_ref().is_none_or(String::is_empty);
        // clean_start defaults to false, which requires a client id
        if client_id_empty && !self.clean_start.unwrap_or(false) {
            return Err("client_id is mandatory when clean_start is set to false".to_string());
        }
        if let (Some(Some(_)), Some(Some(_))) = (&self.sat_file, &self.password_file) {
            return Err("sat_file cannot be used with password_file".to_string());
        }
        if let Some(Some(_)) = &self.key_file {
            match &self.cert_file {
                Some(Some(cert_file)) if !cert_file.is_empty() => {}
                _ => {
                    return Err("cert_file must be used if key_file is used".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Read an environment variable, treating an unset or empty variable as absent.
fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => {
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value))
            }
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(format!("{key} is not valid unicode")),
    }
}

/// Read the trimmed contents of a file named after a configmap key, treating a
/// missing or empty file as absent.
fn string_from_configmap_file(mount: &Path, key: &str) -> Result<Option<String>, String> {
    let path = mount.join(key);
    if !path.exists() {
        return Ok(None);
    }
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(e) => Err(format!("Cannot read {}: {e}", path.display())),
    }
}
