use config::{Config, ConfigError};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

use crate::constants::DEFAULT_COLLECT_TIMEOUT_SECONDS;

/// Node configuration, read from `<dir>/conf.toml` and `DOCSHARD_*` environment variables.
///
/// The node's identity key lives next to it in `<dir>/key`, hex encoded.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocshardConfig {
    config_path: PathBuf,
    pub bootstrappers: Vec<Multiaddr>,
    pub db_path: Option<String>,
    pub collect_timeout_secs: u64,
}

fn foreign<E: std::error::Error + Send + Sync + 'static>(err: E) -> ConfigError {
    ConfigError::Foreign(Box::new(err))
}

impl DocshardConfig {
    /// Loads the configuration in `path`, creating the directory, a fresh identity key and a
    /// default `conf.toml` on first use.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config_path = PathBuf::from(path);
        if !config_path.exists() {
            fs::create_dir_all(&config_path).map_err(foreign)?;
        }

        // only create a key if one doesn't exist
        let key_path = config_path.join("key");
        if !key_path.exists() {
            let keys = Keypair::generate_ed25519();
            let encoded = keys.to_protobuf_encoding().map_err(foreign)?;
            fs::write(&key_path, hex::encode(encoded)).map_err(foreign)?;
        }

        let config_path = config_path.canonicalize().map_err(foreign)?;
        let conf_file = config_path.join("conf.toml");
        if !conf_file.exists() {
            let defaults = DocshardConfig {
                config_path: config_path.clone(),
                bootstrappers: vec![],
                db_path: None,
                collect_timeout_secs: DEFAULT_COLLECT_TIMEOUT_SECONDS,
            };
            let toml = toml::to_string_pretty(&defaults).map_err(foreign)?;
            fs::write(&conf_file, toml).map_err(foreign)?;
        }

        debug!("📝 Loaded config at path: {:#?}", config_path);
        let settings = Config::builder()
            .add_source(config::File::from(conf_file))
            // Eg.. `DOCSHARD_COLLECT_TIMEOUT_SECS=30 docshard combine ...`
            .add_source(config::Environment::with_prefix("DOCSHARD"))
            .build()?;

        settings.try_into()
    }

    /// The node identity stored in `<dir>/key`.
    pub fn key(&self) -> Result<Keypair, ConfigError> {
        let encoded = fs::read_to_string(self.config_path.join("key")).map_err(foreign)?;
        let bytes = hex::decode(encoded.trim()).map_err(foreign)?;
        Keypair::from_protobuf_encoding(&bytes).map_err(foreign)
    }

    pub fn peer_id(&self) -> Result<libp2p::PeerId, ConfigError> {
        Ok(self.key()?.public().to_peer_id())
    }
}

impl TryFrom<Config> for DocshardConfig {
    type Error = ConfigError;

    fn try_from(config: Config) -> Result<Self, Self::Error> {
        let bootstrappers = config
            .get_array("bootstrappers")
            .unwrap_or_default()
            .into_iter()
            .map(|v| {
                let addr = v.into_string()?;
                Multiaddr::from_str(&addr).map_err(foreign)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let db_path = match config.get_string("db_path") {
            Ok(path) => Some(path),
            Err(ConfigError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let collect_timeout_secs = match config.get_int("collect_timeout_secs") {
            Ok(secs) if secs > 0 => secs as u64,
            Ok(secs) => {
                return Err(ConfigError::Message(format!(
                    "collect_timeout_secs must be positive, got {secs}"
                )))
            }
            Err(ConfigError::NotFound(_)) => DEFAULT_COLLECT_TIMEOUT_SECONDS,
            Err(e) => return Err(e),
        };

        Ok(DocshardConfig {
            bootstrappers,
            db_path,
            collect_timeout_secs,
            config_path: config.get_string("config_path")?.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_run_writes_defaults_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node");
        let conf = DocshardConfig::new(path.to_str().unwrap()).unwrap();

        assert!(path.join("key").exists());
        assert!(path.join("conf.toml").exists());
        assert!(conf.bootstrappers.is_empty());
        assert_eq!(conf.db_path, None);
        assert_eq!(conf.collect_timeout_secs, DEFAULT_COLLECT_TIMEOUT_SECONDS);
    }

    #[test]
    fn test_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let first = DocshardConfig::new(&path).unwrap().peer_id().unwrap();
        let second = DocshardConfig::new(&path).unwrap().peer_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reads_edited_conf_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        DocshardConfig::new(&path).unwrap();

        let canonical = dir.path().canonicalize().unwrap();
        let edited = format!(
            "config_path = {:?}\nbootstrappers = [\"/ip4/127.0.0.1/tcp/4001\"]\ndb_path = \"shards.db\"\ncollect_timeout_secs = 30\n",
            canonical.to_str().unwrap()
        );
        fs::write(dir.path().join("conf.toml"), edited).unwrap();

        let conf = DocshardConfig::new(&path).unwrap();
        assert_eq!(conf.bootstrappers.len(), 1);
        assert_eq!(conf.db_path.as_deref(), Some("shards.db"));
        assert_eq!(conf.collect_timeout_secs, 30);
    }
}
