use medrec_database::{DatabaseConfig, ProvisionerConfig, RouterConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Settings for `tenantctl`.
///
/// Layered: built-in defaults, then the optional config file, then
/// `MEDREC__<SECTION>__<KEY>` environment variables (for example
/// `MEDREC__DATABASE__MAX_CONNECTIONS`). `DATABASE_URL` wins over all of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub provisioner: ProvisionerConfig,
    pub router: RouterConfig,
    pub migrations_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            provisioner: ProvisionerConfig::default(),
            router: RouterConfig::default(),
            migrations_dir: PathBuf::from("migrations/tenant"),
        }
    }
}

impl Config {
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MEDREC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("tenantctl-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
            migrations_dir = "/srv/medrec/migrations"

            [database]
            max_connections = 7

            [provisioner]
            verify_checksums = false
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.migrations_dir, PathBuf::from("/srv/medrec/migrations"));
        assert_eq!(config.database.max_connections, 7);
        assert_eq!(config.database.acquire_timeout_secs, 10);
        assert!(!config.provisioner.verify_checksums);
        assert!(config.router.verify_namespace);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = std::env::temp_dir().join("tenantctl-does-not-exist.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
