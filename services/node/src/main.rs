// Node service main entry point.
use anyhow::{Context, Result};
use ripple_node::{config::NodeConfig, net, observability, wiring};
use ripple_store::{DocStore, MemoryStore};
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability();
    let config = NodeConfig::from_env_or_yaml()?;
    // Expose Prometheus metrics on the configured bind address.
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    // TODO: wire a remote document store backend via config.
    let store: Arc<dyn DocStore> = Arc::new(MemoryStore::new());
    let node = wiring::build_node(&config, store, Arc::new(net::TcpPeerConnector));

    let server = net::serve(config.bind, node.router.clone(), node.registry.clone()).await?;
    tracing::info!(addr = %server.local_addr, advertise = %config.advertise_addr, "node listening");

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    server.shutdown();
    node.bulk.close().await.context("close bulk engine")?;
    tracing::info!("node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_starts_and_stops() -> Result<()> {
        let _g1 = EnvGuard::set("RIPPLE_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("RIPPLE_METRICS_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::unset("RIPPLE_NODE_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }
}
