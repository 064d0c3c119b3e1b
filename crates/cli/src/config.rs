use anyhow::{Context, Result};
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const APP_DIR: &str = "upi-registrar";

/// Registrar configuration: optional TOML file, then `UPI_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub registry_url: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/identity.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key_password: Option<String>,
    /// Seals generated escrow keys when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_key_password: Option<String>,
    pub request_timeout_secs: u64,
    pub log_level: String,
    /// `pretty` or `compact`.
    pub log_format: String,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:8080/api/".to_string(),
            data_dir: dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from("./upi-data")),
            identity_key_file: None,
            identity_key_password: None,
            escrow_key_password: None,
            request_timeout_secs: 10,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl RegistrarConfig {
    /// Load from `path_override`, or from the default location if it exists.
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let resolved_path = match path_override {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path.to_path_buf())
            }
            None => default_config_path().filter(|path| path.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix("UPI"));

        let config = builder
            .build()
            .context("failed to read registrar configuration")?;
        let config: RegistrarConfig = config
            .try_deserialize()
            .context("invalid registrar configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "compact") {
            anyhow::bail!("log_format must be `pretty` or `compact`, got `{}`", self.log_format);
        }
        Ok(())
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.identity_key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("identity.json"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Copy safe to print: passwords are masked.
    pub fn redacted(&self) -> Self {
        let mask = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>".to_string());
        Self {
            identity_key_password: mask(&self.identity_key_password),
            escrow_key_password: mask(&self.escrow_key_password),
            ..self.clone()
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

/// Logs go to stderr so command output on stdout stays machine readable.
pub fn init_logging(config: &RegistrarConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "compact" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}
