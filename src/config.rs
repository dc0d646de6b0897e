use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_PATH: &str = "data.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Postgres { database_url: String },
    Json { path: PathBuf },
}

impl Backend {
    pub fn tag(&self) -> &'static str {
        match self {
            Backend::Postgres { .. } => "postgres",
            Backend::Json { .. } => "json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    pub secret_key: String,
    pub bind: SocketAddr,
    pub allow_blank_remarks: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match get("STORE_BACKEND").as_deref().unwrap_or("postgres") {
            "postgres" | "postgresql" => Backend::Postgres {
                database_url: get("DATABASE_URL")
                    .ok_or_else(|| anyhow!("DATABASE_URL environment variable is not set"))?,
            },
            "json" => Backend::Json {
                path: get("DATA_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH)),
            },
            other => bail!("Unknown STORE_BACKEND `{}` (expected `postgres` or `json`)", other),
        };

        let secret_key =
            get("SECRET_KEY").ok_or_else(|| anyhow!("SECRET_KEY environment variable is not set"))?;

        let host: IpAddr = match get("HOST") {
            Some(host) => host.parse().with_context(|| format!("Invalid HOST `{}`", host))?,
            None => IpAddr::from([0, 0, 0, 0]),
        };
        let port = match get("PORT") {
            Some(port) => port.parse().with_context(|| format!("Invalid PORT `{}`", port))?,
            None => DEFAULT_PORT,
        };

        let allow_blank_remarks = match get("ALLOW_BLANK_REMARKS") {
            Some(flag) => parse_flag(&flag)
                .ok_or_else(|| anyhow!("Invalid ALLOW_BLANK_REMARKS `{}`", flag))?,
            None => false,
        };

        Ok(Self {
            backend,
            secret_key,
            bind: SocketAddr::new(host, port),
            allow_blank_remarks,
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
