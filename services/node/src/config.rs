use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Node service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Client/peer TCP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Address other nodes use to reach this one; stored in subscription
    // records and compared against at fanout time.
    pub advertise_addr: String,
    // Document store index all pub/sub records live in.
    pub pubsub_index: String,
    // Bulk engine in-flight flush limit; 0 runs flushes inline.
    pub bulk_max_concurrent_flushes: usize,
    // Bulk buffer size that triggers a flush; -1 disables the trigger.
    pub bulk_max_buffered_ops: i64,
    // Periodic bulk flush; 0 disables the timer.
    pub bulk_flush_interval_ms: u64,
    // Page size for fanout and replay scans.
    pub scan_page_size: usize,
    // Scan cursor lifetime between page fetches.
    pub scan_keep_alive_ms: u64,
}

const DEFAULT_PUBSUB_INDEX: &str = "pubsub";
const DEFAULT_ADVERTISE_ADDR: &str = "127.0.0.1:7420";
const DEFAULT_BULK_MAX_CONCURRENT_FLUSHES: usize = 32;
const DEFAULT_BULK_MAX_BUFFERED_OPS: i64 = 100;
const DEFAULT_BULK_FLUSH_INTERVAL_MS: u64 = 0;
const DEFAULT_SCAN_PAGE_SIZE: usize = 100;
const DEFAULT_SCAN_KEEP_ALIVE_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
struct NodeConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    advertise_addr: Option<String>,
    pubsub_index: Option<String>,
    bulk_max_concurrent_flushes: Option<usize>,
    bulk_max_buffered_ops: Option<i64>,
    bulk_flush_interval_ms: Option<u64>,
    scan_page_size: Option<usize>,
    scan_keep_alive_ms: Option<u64>,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("RIPPLE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7420".to_string())
            .parse()
            .with_context(|| "parse RIPPLE_BIND")?;
        let metrics_bind = std::env::var("RIPPLE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse RIPPLE_METRICS_BIND")?;
        let advertise_addr = std::env::var("RIPPLE_ADVERTISE_ADDR")
            .unwrap_or_else(|_| DEFAULT_ADVERTISE_ADDR.to_string());
        let pubsub_index = std::env::var("RIPPLE_PUBSUB_INDEX")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PUBSUB_INDEX.to_string());
        let bulk_max_concurrent_flushes = std::env::var("RIPPLE_BULK_MAX_FLUSHES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BULK_MAX_CONCURRENT_FLUSHES);
        let bulk_max_buffered_ops = std::env::var("RIPPLE_BULK_MAX_OPS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value >= -1)
            .unwrap_or(DEFAULT_BULK_MAX_BUFFERED_OPS);
        let bulk_flush_interval_ms = std::env::var("RIPPLE_BULK_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_BULK_FLUSH_INTERVAL_MS);
        let scan_page_size = std::env::var("RIPPLE_SCAN_PAGE_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SCAN_PAGE_SIZE);
        let scan_keep_alive_ms = std::env::var("RIPPLE_SCAN_KEEP_ALIVE_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SCAN_KEEP_ALIVE_MS);
        Ok(Self {
            bind,
            metrics_bind,
            advertise_addr,
            pubsub_index,
            bulk_max_concurrent_flushes,
            bulk_max_buffered_ops,
            bulk_flush_interval_ms,
            scan_page_size,
            scan_keep_alive_ms,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("RIPPLE_NODE_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read RIPPLE_NODE_CONFIG: {path}"))?;
            let override_cfg: NodeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse node config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.advertise_addr {
                config.advertise_addr = value;
            }
            if let Some(value) = override_cfg.pubsub_index
                && !value.is_empty()
            {
                config.pubsub_index = value;
            }
            if let Some(value) = override_cfg.bulk_max_concurrent_flushes {
                config.bulk_max_concurrent_flushes = value;
            }
            if let Some(value) = override_cfg.bulk_max_buffered_ops
                && value >= -1
            {
                config.bulk_max_buffered_ops = value;
            }
            if let Some(value) = override_cfg.bulk_flush_interval_ms {
                config.bulk_flush_interval_ms = value;
            }
            if let Some(value) = override_cfg.scan_page_size
                && value > 0
            {
                config.scan_page_size = value;
            }
            if let Some(value) = override_cfg.scan_keep_alive_ms
                && value > 0
            {
                config.scan_keep_alive_ms = value;
            }
        }
        Ok(config)
    }
}
