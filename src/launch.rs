//! Container specification for one validator node.

use crate::registry::Host;
use crate::topology::Node;
use crate::types::{BindMount, ContainerSpec};

pub const ENV_NODE_ALIAS: &str = "SEBAK_NODE_ALIAS";
pub const ENV_TLS_CERT: &str = "SEBAK_TLS_CERT";
pub const ENV_TLS_KEY: &str = "SEBAK_TLS_KEY";
pub const ENV_LOG_LEVEL: &str = "SEBAK_LOG_LEVEL";
pub const ENV_SECRET_SEED: &str = "SEBAK_SECRET_SEED";
pub const ENV_NETWORK_ID: &str = "SEBAK_NETWORK_ID";
pub const ENV_BIND: &str = "SEBAK_BIND";
pub const ENV_PUBLISH: &str = "SEBAK_PUBLISH";
pub const ENV_GENESIS_BLOCK: &str = "SEBAK_GENESIS_BLOCK";
pub const ENV_COMMON_ACCOUNT: &str = "SEBAK_COMMON_ACCOUNT";
pub const ENV_VALIDATORS: &str = "SEBAK_VALIDATORS";

pub const TLS_CERT_PATH: &str = "/sebak.crt";
pub const TLS_KEY_PATH: &str = "/sebak.key";
pub const DEFAULT_NETWORK_ID: &str = "test sebak-network";
const ENTRYPOINT: [&str; 2] = ["/bin/sh", "/entrypoint.sh"];

/// Values shared by every node of one launch.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub image_id: String,
    pub genesis: String,
    pub common_seed: String,
    pub log_level: String,
    pub network_id: String,
}

/// Validator list as the node expects it: `self` followed by one
/// `endpoint?address=<address>` token per peer.
pub fn validators_env(node: &Node) -> String {
    std::iter::once("self".to_string())
        .chain(node.validators().iter().map(|v| v.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn node_spec(node: &Node, host: &Host, settings: &LaunchSettings) -> ContainerSpec {
    let mut env = vec![
        format!("{}={}", ENV_NODE_ALIAS, node.alias),
        format!("{}={}", ENV_TLS_CERT, TLS_CERT_PATH),
        format!("{}={}", ENV_TLS_KEY, TLS_KEY_PATH),
        format!("{}={}", ENV_LOG_LEVEL, settings.log_level),
        format!("{}={}", ENV_SECRET_SEED, node.keypair.seed()),
        format!("{}={}", ENV_NETWORK_ID, settings.network_id),
        format!("{}={}", ENV_BIND, node.endpoint.bind_all()),
        format!("{}={}", ENV_PUBLISH, node.endpoint),
        format!("{}={}", ENV_GENESIS_BLOCK, settings.genesis),
        format!("{}={}", ENV_COMMON_ACCOUNT, settings.common_seed),
        format!("{}={}", ENV_VALIDATORS, validators_env(node)),
    ];
    env.extend(host.env.iter().map(|e| e.to_string()));

    ContainerSpec {
        image: settings.image_id.clone(),
        entrypoint: ENTRYPOINT.iter().map(|s| s.to_string()).collect(),
        env,
        mounts: host
            .volumes
            .iter()
            .map(|v| BindMount {
                source: v.source.clone(),
                target: v.target.clone(),
            })
            .collect(),
        ports: vec![node.endpoint.port],
        host_network: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvVar, Volume};
    use crate::runtime::mock::MockRuntime;
    use crate::topology::{compose, HostSlot};
    use std::sync::Arc;

    fn settings() -> LaunchSettings {
        LaunchSettings {
            image_id: "sha256:abc".into(),
            genesis: "GGENESIS".into(),
            common_seed: "SCOMMON".into(),
            log_level: "debug".into(),
            network_id: DEFAULT_NETWORK_ID.into(),
        }
    }

    #[test]
    fn spec_carries_identity_addresses_and_peers() {
        let topology = compose(
            3,
            &[
                HostSlot { ip: "10.0.0.1", seeds: &[] },
                HostSlot { ip: "10.0.0.2", seeds: &[] },
            ],
        )
        .unwrap();
        let node = topology.nodes_on(0).nth(1).unwrap();

        let mut host = Host::new("a", Arc::new(MockRuntime::new("tcp://10.0.0.1:2376")));
        host.volumes = vec![Volume {
            source: "/srv/data".into(),
            target: "/data".into(),
        }];
        host.env = vec![EnvVar {
            key: "EXTRA".into(),
            value: "1".into(),
        }];

        let spec = node_spec(node, &host, &settings());

        assert_eq!(spec.image, "sha256:abc");
        assert_eq!(spec.env_value(ENV_NODE_ALIAS), Some("0001"));
        assert_eq!(spec.env_value(ENV_BIND), Some("https://0.0.0.0:12001"));
        assert_eq!(spec.env_value(ENV_PUBLISH), Some("https://10.0.0.1:12001"));
        assert_eq!(
            spec.env_value(ENV_SECRET_SEED).map(str::to_string),
            Some(node.keypair.seed())
        );
        assert_eq!(spec.env_value(ENV_NETWORK_ID), Some(DEFAULT_NETWORK_ID));
        assert_eq!(spec.env_value("EXTRA"), Some("1"));
        assert_eq!(spec.ports, vec![12001]);
        assert_eq!(spec.mounts[0].target, "/data");
        assert!(spec.host_network);

        let validators: Vec<_> = spec
            .env_value(ENV_VALIDATORS)
            .unwrap()
            .split(' ')
            .collect();
        assert_eq!(validators.len(), 3);
        assert_eq!(validators[0], "self");
        for peer in topology.nodes().values().filter(|n| n.alias != node.alias) {
            let token = format!("{}?address={}", peer.endpoint, peer.address());
            assert!(validators.contains(&token.as_str()), "missing {}", token);
        }
    }
}
