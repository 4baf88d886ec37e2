//! Workspace configuration.
//!
//! Loaded from a TOML file. Every value may be overridden through `INGEST_CONFIG_` environment
//! variables, with `__` separating nested keys: `INGEST_CONFIG_METADATA_DB__URL` overrides
//! `metadata_db.url`. Relative paths are resolved against the directory of the config file.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use fs_err as fs;
pub use ingest::config::{ConfigDuration, ParquetConfig};
use ingest::{DataStore, data_store::DataStoreError};
use metadata_db::{DEFAULT_POOL_SIZE, MetadataDb};
pub use monitoring::config::OpenTelemetryConfig;
use serde::Deserialize;
use url::Url;

/// Prefix of the environment variables overriding config file values
pub const ENV_PREFIX: &str = "INGEST_CONFIG_";

/// Name of the metadata database file created in the data directory when no URL is configured
pub const DEFAULT_METADATA_DB_FILENAME: &str = "metadata.db";

/// Sub-directory of the data directory holding segment files
pub const SEGMENTS_DIRNAME: &str = "segments";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    /// Root of the segment store and of the default metadata database
    pub data_dir: PathBuf,
    pub metadata_db: MetadataDbConfig,
    pub ingest: IngestConfig,
    pub parquet: ParquetConfig,
    pub coordinator: CoordinatorConfig,
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

#[derive(Debug, Clone)]
pub struct MetadataDbConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub max_num_concurrent_sub_tasks: usize,
    pub availability_poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A remote coordinator. Tasks run against an in-process coordinator when unset.
    pub url: Option<Url>,
    /// Delay between load cycles of the in-process coordinator
    pub load_period: Duration,
    /// Where `coordinator serve` listens
    pub addr: SocketAddr,
}

/// The config file as written.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Where segments and the default metadata database are stored (default: "data")
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub metadata_db: MetadataDbConfigFile,
    #[serde(default)]
    pub ingest: IngestConfigFile,
    #[serde(default)]
    pub writer: ParquetConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfigFile,
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataDbConfigFile {
    /// SQLite connection URL (default: `<data_dir>/metadata.db`)
    pub url: Option<String>,
    /// Size of the connection pool (default: 10)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for MetadataDbConfigFile {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfigFile {
    /// Upper bound on concurrently running sub-tasks (default: available parallelism)
    pub max_num_concurrent_sub_tasks: Option<usize>,
    /// Delay between availability polls in seconds (default: 1.0)
    #[serde(default)]
    pub availability_poll_interval_secs: ConfigDuration<1>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinatorConfigFile {
    pub url: Option<Url>,
    /// Load cycle period of the in-process coordinator in seconds (default: 1.0)
    #[serde(default)]
    pub load_period_secs: ConfigDuration<1>,
    /// Listen address of `coordinator serve` (default: "127.0.0.1:8081")
    pub addr: Option<String>,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_coordinator_addr() -> SocketAddr {
    ([127, 0, 0, 1], 8081).into()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error at {0}: {1}")]
    Figment(PathBuf, figment::Error),
    #[error("Invalid value at {0}: {1}")]
    InvalidValue(PathBuf, &'static str),
    #[error("Invalid address format for {0}: {1}")]
    InvalidAddress(String, String),
    #[error("Metadata DB error at {0}: {1}")]
    MetadataDb(PathBuf, metadata_db::Error),
    #[error("Data store error at {0}: {1}")]
    DataStore(PathBuf, DataStoreError),
}

impl Config {
    /// Loads the config file at `file`.
    ///
    /// With `env_override`, `INGEST_CONFIG_*` environment variables take precedence over the
    /// file. `config_override` takes precedence over both.
    pub fn load(
        file: impl Into<PathBuf>,
        env_override: bool,
        config_override: Option<Figment>,
    ) -> Result<Self, ConfigError> {
        let input_path = file.into();
        let config_path = fs::canonicalize(&input_path)
            .map_err(|err| ConfigError::Io(input_path.clone(), err))?;
        let contents = fs::read_to_string(&config_path)
            .map_err(|err| ConfigError::Io(config_path.clone(), err))?;

        let config_file: ConfigFile = {
            let mut config_builder = Figment::new().merge(Toml::string(&contents));
            if env_override {
                config_builder = config_builder.merge(Env::prefixed(ENV_PREFIX).split("__"));
            }
            if let Some(config_override) = config_override {
                config_builder = config_builder.merge(config_override);
            }
            config_builder
                .extract()
                .map_err(|err| ConfigError::Figment(config_path.clone(), err))?
        };

        Self::from_config_file(config_file, config_path)
    }

    fn from_config_file(config_file: ConfigFile, config_path: PathBuf) -> Result<Self, ConfigError> {
        let base = config_path.parent().unwrap_or(Path::new("."));
        let data_dir = base.join(&config_file.data_dir);

        let metadata_db = MetadataDbConfig {
            url: config_file.metadata_db.url.unwrap_or_else(|| {
                format!(
                    "sqlite://{}",
                    data_dir.join(DEFAULT_METADATA_DB_FILENAME).display()
                )
            }),
            pool_size: config_file.metadata_db.pool_size,
        };

        let max_num_concurrent_sub_tasks = config_file
            .ingest
            .max_num_concurrent_sub_tasks
            .unwrap_or_else(ingest::config::default_max_num_concurrent_sub_tasks);
        if max_num_concurrent_sub_tasks == 0 {
            return Err(ConfigError::InvalidValue(
                config_path,
                "ingest.max_num_concurrent_sub_tasks must be at least 1",
            ));
        }
        let availability_poll_interval: Duration =
            config_file.ingest.availability_poll_interval_secs.into();
        if availability_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                config_path,
                "ingest.availability_poll_interval_secs must be positive",
            ));
        }

        let addr = match &config_file.coordinator.addr {
            Some(addr) => addr.parse::<SocketAddr>().map_err(|err| {
                ConfigError::InvalidAddress("coordinator.addr".to_string(), err.to_string())
            })?,
            None => default_coordinator_addr(),
        };

        Ok(Self {
            data_dir,
            metadata_db,
            ingest: IngestConfig {
                max_num_concurrent_sub_tasks,
                availability_poll_interval,
            },
            parquet: config_file.writer,
            coordinator: CoordinatorConfig {
                url: config_file.coordinator.url,
                load_period: config_file.coordinator.load_period_secs.into(),
                addr,
            },
            opentelemetry: config_file.opentelemetry,
            config_path,
        })
    }

    /// Connects to the metadata database, creating it if missing.
    pub async fn metadata_db(&self) -> Result<MetadataDb, ConfigError> {
        if let Some(path) = self.metadata_db.url.strip_prefix("sqlite://") {
            if let Some(dir) = Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    fs::create_dir_all(dir)
                        .map_err(|err| ConfigError::Io(dir.to_path_buf(), err))?;
                }
            }
        }
        MetadataDb::connect_with_retry(&self.metadata_db.url, self.metadata_db.pool_size)
            .await
            .map_err(|err| ConfigError::MetadataDb(self.config_path.clone(), err))
    }

    /// The segment store under the data directory.
    pub fn data_store(&self) -> Result<DataStore, ConfigError> {
        DataStore::local(self.data_dir.join(SEGMENTS_DIRNAME))
            .map_err(|err| ConfigError::DataStore(self.config_path.clone(), err))
    }

    /// Runtime settings of the ingestion tasks.
    pub fn ingest_config(&self) -> ingest::Config {
        ingest::Config {
            max_num_concurrent_sub_tasks: self.ingest.max_num_concurrent_sub_tasks,
            availability_poll_interval: self.ingest.availability_poll_interval,
            parquet: self.parquet.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::parquet::basic::Compression;
    use figment::providers::Serialized;
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("Failed to write config file");
        path
    }

    #[test]
    fn defaults_are_relative_to_the_config_file() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(&dir, "");

        //* When
        let config = Config::load(&path, false, None).expect("Failed to load config");

        //* Then
        let base = fs::canonicalize(dir.path()).expect("Failed to canonicalize temp dir");
        assert_eq!(config.data_dir, base.join("data"));
        assert_eq!(
            config.metadata_db.url,
            format!("sqlite://{}", base.join("data").join("metadata.db").display())
        );
        assert_eq!(config.metadata_db.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.ingest.availability_poll_interval, Duration::from_secs(1));
        assert_eq!(config.coordinator.url, None);
        assert_eq!(config.coordinator.load_period, Duration::from_secs(1));
        assert_eq!(config.coordinator.addr, default_coordinator_addr());
        assert!(config.ingest.max_num_concurrent_sub_tasks >= 1);
        assert!(config.opentelemetry.is_none());
    }

    #[test]
    fn file_values_are_applied() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(
            &dir,
            r#"
            data_dir = "store"

            [metadata_db]
            url = "sqlite::memory:"
            pool_size = 2

            [ingest]
            max_num_concurrent_sub_tasks = 3
            availability_poll_interval_secs = 0.25

            [writer]
            compression = "snappy"

            [coordinator]
            url = "http://localhost:8081"
            load_period_secs = 0.5
            addr = "0.0.0.0:9000"
            "#,
        );

        //* When
        let config = Config::load(&path, false, None).expect("Failed to load config");

        //* Then
        assert!(config.data_dir.ends_with("store"));
        assert_eq!(config.metadata_db.url, "sqlite::memory:");
        assert_eq!(config.metadata_db.pool_size, 2);
        let ingest = config.ingest_config();
        assert_eq!(ingest.max_num_concurrent_sub_tasks, 3);
        assert_eq!(ingest.availability_poll_interval, Duration::from_millis(250));
        assert_eq!(ingest.parquet.compression, Compression::SNAPPY);
        assert_eq!(
            config.coordinator.url.as_ref().map(Url::as_str),
            Some("http://localhost:8081/")
        );
        assert_eq!(config.coordinator.load_period, Duration::from_millis(500));
        assert_eq!(config.coordinator.addr, ([0, 0, 0, 0], 9000).into());
    }

    #[test]
    fn overrides_take_precedence_over_the_file() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(
            &dir,
            r#"
            [ingest]
            max_num_concurrent_sub_tasks = 3
            "#,
        );
        let config_override =
            Figment::from(Serialized::default("ingest.max_num_concurrent_sub_tasks", 7));

        //* When
        let config =
            Config::load(&path, false, Some(config_override)).expect("Failed to load config");

        //* Then
        assert_eq!(config.ingest.max_num_concurrent_sub_tasks, 7);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(
            &dir,
            r#"
            [ingest]
            max_num_concurrent_sub_tasks = 0
            "#,
        );

        //* When
        let result = Config::load(&path, false, None);

        //* Then
        assert!(matches!(result, Err(ConfigError::InvalidValue(_, _))));
    }

    #[test]
    fn invalid_coordinator_addr_is_rejected() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(
            &dir,
            r#"
            [coordinator]
            addr = "not an address"
            "#,
        );

        //* When
        let result = Config::load(&path, false, None);

        //* Then
        assert!(matches!(
            result,
            Err(ConfigError::InvalidAddress(name, _)) if name == "coordinator.addr"
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        let result = Config::load(dir.path().join("missing.toml"), false, None);

        assert!(matches!(result, Err(ConfigError::Io(_, _))));
    }

    #[tokio::test]
    async fn metadata_db_and_data_store_are_created_in_the_data_dir() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_config(&dir, "");
        let config = Config::load(&path, false, None).expect("Failed to load config");

        //* When
        let _db = config
            .metadata_db()
            .await
            .expect("Failed to connect to metadata db");
        let _store = config.data_store().expect("Failed to create data store");

        //* Then
        assert!(config.data_dir.join(DEFAULT_METADATA_DB_FILENAME).exists());
        assert!(config.data_dir.join(SEGMENTS_DIRNAME).is_dir());
    }
}
