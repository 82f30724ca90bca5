use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::debug;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ComposerError, Result};
use crate::keypair::{self, Keypair};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Genesis account address.
    #[serde(default)]
    pub genesis: String,
    /// Common account, given as an address or as a secret seed.
    #[serde(default)]
    pub common: String,
    /// Build context used by `build`.
    #[serde(rename = "docker-path", alias = "docker_path", default)]
    pub docker_path: PathBuf,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

/// One remote Docker endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostConfig {
    pub host: String,
    #[serde(default)]
    pub ca: PathBuf,
    #[serde(default)]
    pub cert: PathBuf,
    #[serde(default)]
    pub cert_key: PathBuf,
    #[serde(default)]
    pub volume: Vec<Volume>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Secret seeds for the nodes placed on this host, in order.
    #[serde(default)]
    pub seeds: Vec<String>,
}

/// Bind mount given as `source:target`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Volume {
    pub source: String,
    pub target: String,
}

impl TryFrom<String> for Volume {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.split_once(':') {
            Some((source, target)) if !source.is_empty() && !target.is_empty() => Ok(Volume {
                source: source.to_string(),
                target: target.to_string(),
            }),
            _ => Err(format!("invalid volume: '{}'", s)),
        }
    }
}

impl From<Volume> for String {
    fn from(v: Volume) -> Self {
        format!("{}:{}", v.source, v.target)
    }
}

/// Extra container environment given as `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl TryFrom<String> for EnvVar {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(EnvVar {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("invalid env: '{}'", s)),
        }
    }
}

impl From<EnvVar> for String {
    fn from(e: EnvVar) -> Self {
        e.to_string()
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl Config {
    /// Loads and validates the config file at `path`.  Missing genesis or
    /// common identities are generated and printed once.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ComposerError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(
                Env::prefixed("NETWORK_COMPOSER_")
                    .only(&["genesis", "common", "docker_path"])
                    .map(|key| key.as_str().replace('_', "-").into()),
            )
            .extract()?;

        config.validate()?;

        if config.genesis.is_empty() {
            let kp = Keypair::random();
            println!(
                "genesis keypair created seed={} address={}",
                kp.seed(),
                kp.address()
            );
            config.genesis = kp.address();
        }
        if config.common.is_empty() {
            let kp = Keypair::random();
            println!(
                "common keypair created seed={} address={}",
                kp.seed(),
                kp.address()
            );
            config.common = kp.address();
        }

        debug!("loaded config from {}: {} hosts", path.display(), config.hosts.len());
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ComposerError::Config("no `hosts` configured".into()));
        }

        if !self.genesis.is_empty() {
            keypair::parse_address(&self.genesis)
                .map_err(|e| ComposerError::Config(format!("invalid `genesis`: {}", e)))?;
        }
        if !self.common.is_empty() && Keypair::from_seed(&self.common).is_err() {
            keypair::parse_address(&self.common)
                .map_err(|e| ComposerError::Config(format!("invalid `common`: {}", e)))?;
        }

        let mut seen = HashSet::new();
        for (alias, host) in self.hosts.iter_mut() {
            host.validate()
                .map_err(|e| ComposerError::Config(format!("host `{}`: {}", alias, e)))?;
            if !seen.insert(host.host.clone()) {
                return Err(ComposerError::Config(format!(
                    "host `{}`: duplicated endpoint {}",
                    alias, host.host
                )));
            }
        }
        Ok(())
    }

    /// Hosts ordered by endpoint, the order topology composition relies on.
    pub fn ordered_hosts(&self) -> Vec<(&str, &HostConfig)> {
        let mut hosts: Vec<_> = self
            .hosts
            .iter()
            .map(|(alias, h)| (alias.as_str(), h))
            .collect();
        hosts.sort_by(|a, b| a.1.host.cmp(&b.1.host));
        hosts
    }

    /// Secret seed handed to the nodes as the common account.  Only a seed
    /// given in the config is reused; for an address a fresh keypair is
    /// generated, since nodes need the private key.
    pub fn common_seed(&self) -> String {
        match Keypair::from_seed(&self.common) {
            Ok(kp) => kp.seed(),
            Err(_) => {
                let kp = Keypair::random();
                debug!("common account for this run: {}", kp.address());
                kp.seed()
            }
        }
    }
}

impl HostConfig {
    fn validate(&mut self) -> std::result::Result<(), String> {
        let mut url = Url::parse(&self.host).map_err(|e| format!("invalid `host`: {}", e))?;
        if url.host_str().is_none() {
            return Err(format!("`host` has no hostname: {}", self.host));
        }
        url.set_query(None);
        self.host = url.to_string().trim_end_matches('/').to_string();

        for (name, path) in [
            ("ca", &mut self.ca),
            ("cert", &mut self.cert),
            ("cert_key", &mut self.cert_key),
        ] {
            if path.as_os_str().is_empty() {
                return Err(format!("`{}` is missing", name));
            }
            *path = expand_home(path);
        }

        for seed in &self.seeds {
            Keypair::from_seed(seed).map_err(|e| format!("invalid seed: {}", e))?;
        }
        Ok(())
    }

    pub fn seed_keypairs(&self) -> Result<Vec<Keypair>> {
        self.seeds.iter().map(|s| Keypair::from_seed(s)).collect()
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const TWO_HOSTS: &str = r#"
docker-path = "./docker"

[hosts.zeta]
host = "tcp://10.0.0.2:2376?ignored=1"
ca = "/certs/ca.pem"
cert = "/certs/cert.pem"
cert_key = "/certs/key.pem"
volume = ["/data:/sebak/data"]
env = ["EXTRA=1", "EMPTY="]

[hosts.alpha]
host = "tcp://10.0.0.9:2376"
ca = "~/certs/ca.pem"
cert = "/certs/cert.pem"
cert_key = "/certs/key.pem"
"#;

    #[test]
    fn loads_typed_hosts_and_generates_identities() {
        let file = write_config(TWO_HOSTS);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.docker_path, PathBuf::from("./docker"));
        assert!(config.genesis.starts_with('G'));
        assert!(config.common.starts_with('G'));
        assert!(Keypair::from_seed(&config.common_seed()).is_ok());

        let zeta = &config.hosts["zeta"];
        assert_eq!(zeta.host, "tcp://10.0.0.2:2376");
        assert_eq!(
            zeta.volume,
            vec![Volume {
                source: "/data".into(),
                target: "/sebak/data".into()
            }]
        );
        assert_eq!(zeta.env[0].to_string(), "EXTRA=1");
        assert_eq!(zeta.env[1].value, "");

        let alpha = &config.hosts["alpha"];
        assert!(!alpha.ca.starts_with("~"));
    }

    #[test]
    fn hosts_are_ordered_by_endpoint() {
        let file = write_config(TWO_HOSTS);
        let config = Config::load(file.path()).unwrap();
        let order: Vec<_> = config.ordered_hosts().into_iter().map(|(a, _)| a).collect();
        assert_eq!(order, vec!["zeta", "alpha"]);
    }

    #[test]
    fn missing_tls_material_is_fatal() {
        let file = write_config(
            r#"
[hosts.a]
host = "tcp://10.0.0.2:2376"
ca = "/certs/ca.pem"
cert = "/certs/cert.pem"
"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("`cert_key` is missing"), "{}", err);
    }

    #[test]
    fn malformed_volume_is_fatal() {
        let file = write_config(
            r#"
[hosts.a]
host = "tcp://10.0.0.2:2376"
ca = "/c"
cert = "/c"
cert_key = "/c"
volume = ["nocolon"]
"#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    fn with_common(common: &str) -> tempfile::NamedTempFile {
        write_config(&format!(
            r#"
common = "{}"
[hosts.a]
host = "tcp://10.0.0.2:2376"
ca = "/c"
cert = "/c"
cert_key = "/c"
"#,
            common
        ))
    }

    #[test]
    fn common_account_address_is_accepted() {
        let address = Keypair::random().address();
        let file = with_common(&address);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.common, address);

        let seed = config.common_seed();
        assert!(seed.starts_with('S'));
        assert!(Keypair::from_seed(&seed).is_ok());
    }

    #[test]
    fn common_account_seed_is_reused() {
        let seed = Keypair::random().seed();
        let file = with_common(&seed);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.common_seed(), seed);
    }

    #[test]
    fn malformed_common_account_is_fatal() {
        let file = with_common("GNOTANADDRESS");
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid `common`"), "{}", err);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Path::new("/nonexistent/composer.toml")).unwrap_err();
        assert!(matches!(err, ComposerError::Config(_)));
    }

    #[test]
    fn empty_hosts_is_fatal() {
        let file = write_config("genesis = \"\"\n");
        assert!(Config::load(file.path()).is_err());
    }
}
