use anyhow::Result;
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub build: BuildConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Seconds after which a `Building` entry is considered abandoned and
    /// treated as not built by rebuild decisions.
    pub staleness_seconds: u64,
    /// How long a build call waits on another in-flight build of the same
    /// entry before giving up with a concurrency error.
    pub build_wait_seconds: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            staleness_seconds: 600,
            build_wait_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Optional bound on concurrently running background tasks; unbounded
    /// when absent.
    pub max_concurrent_tasks: Option<usize>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("GRID_STUDY__").split("__"));
        Ok(figment.extract()?)
    }
}
