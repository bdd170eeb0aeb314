use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result, ensure};

use crate::{NetworkId, RouterId};

/// Timers and limits of the link-state protocol, shared by every router of a
/// topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub hello_interval_ms: u64,
    pub dead_interval_ms: u64,
    pub lsu_refresh_interval_ms: u64,
    pub aging_interval_ms: u64,
    pub lsa_max_age_secs: u64,
    pub spf_delay_ms: u64,
    pub default_link_metric: u32,
    pub inject_queue_depth: usize,
    pub default_mtu: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hello_interval_ms: 5_000,        // 5 seconds
            dead_interval_ms: 20_000,        // 20 seconds
            lsu_refresh_interval_ms: 15_000, // 15 seconds
            aging_interval_ms: 1_000,
            lsa_max_age_secs: 60,
            spf_delay_ms: 200,
            default_link_metric: 1,
            inject_queue_depth: 1024,
            default_mtu: 1500,
        }
    }
}

impl ProtocolConfig {
    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms)
    }

    pub fn dead_interval(&self) -> Duration {
        Duration::from_millis(self.dead_interval_ms)
    }

    pub fn lsu_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lsu_refresh_interval_ms)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }

    pub fn lsa_max_age(&self) -> Duration {
        Duration::from_secs(self.lsa_max_age_secs)
    }

    pub fn spf_delay(&self) -> Duration {
        Duration::from_millis(self.spf_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.hello_interval_ms > 0, "hello interval must be positive");
        ensure!(self.aging_interval_ms > 0, "aging interval must be positive");
        ensure!(self.lsu_refresh_interval_ms > 0, "LSU refresh interval must be positive");
        ensure!(
            self.dead_interval_ms > self.hello_interval_ms,
            "dead interval ({} ms) must exceed hello interval ({} ms)",
            self.dead_interval_ms,
            self.hello_interval_ms
        );
        ensure!(
            self.lsa_max_age() > self.lsu_refresh_interval(),
            "LSA max age must exceed the LSU refresh interval"
        );
        ensure!(self.inject_queue_depth > 0, "inject queue depth must be positive");
        ensure!(self.default_mtu >= 576, "MTU below the IPv4 minimum of 576");
        Ok(())
    }

    /// Compressed timers for tests and demos.
    pub fn fast() -> Self {
        Self {
            hello_interval_ms: 100,
            dead_interval_ms: 400,
            lsu_refresh_interval_ms: 1_000,
            aging_interval_ms: 100,
            lsa_max_age_secs: 5,
            spf_delay_ms: 10,
            ..Self::default()
        }
    }
}

/// A router to create at startup. Omitted fields fall back to manager
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterSpec {
    #[serde(default)]
    pub id: Option<RouterId>,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub network: Option<NetworkId>,
    #[serde(default)]
    pub mtu: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub a: RouterId,
    pub b: RouterId,
    #[serde(default)]
    pub metric: Option<u32>,
}

/// Whole-topology bootstrap file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub routers: Vec<RouterSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

impl TopologyConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading topology file {}", path))?;
        let config: TopologyConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing topology file {}", path))?;
        config.protocol.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Routers `r1..rn` joined in a chain, used when no file is given.
    pub fn chain(count: usize) -> Self {
        let routers = (1..=count)
            .map(|i| RouterSpec {
                id: Some(format!("r{}", i)),
                ..RouterSpec::default()
            })
            .collect();
        let connections = (1..count)
            .map(|i| ConnectionSpec {
                a: format!("r{}", i),
                b: format!("r{}", i + 1),
                metric: None,
            })
            .collect();

        Self {
            protocol: ProtocolConfig::default(),
            routers,
            connections,
        }
    }
}
