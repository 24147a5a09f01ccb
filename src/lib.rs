//! V-LESS/V-MESS server core: accepts connections, authenticates the
//! handshake, and relays the proxied body through the shared tunnel.
//!
//! # Architecture
//!
//! ```text
//! +-------------+
//! |   inbound/  |  (VLESS, VMess, plus the teacher's HTTP/SOCKS5/Mixed)
//! +------+------+
//!        |
//! +------v------+
//! |   tunnel/   |  (metadata -> rule match -> outbound dial)
//! +------+------+
//!        |
//!   +----+----+
//!   |         |
//! +-v--+   +--v---+
//! |rule|   |outbound|
//! +----+   +--------+
//! ```

pub mod common;
pub mod config;
pub mod dns;
pub mod inbound;
pub mod outbound;
pub mod provider;
pub mod proxy;
pub mod rule;
pub mod statistic;
pub mod transport;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Mihomo version (compatible with Go version)
pub const VERSION: &str = "1.10.0";
pub const META: bool = true;

/// Gateway instance managing all components
pub struct Gateway {
    config: Arc<RwLock<Config>>,
    tunnel: Arc<tunnel::Tunnel>,
    dns_resolver: Arc<dns::Resolver>,
    statistic: Arc<statistic::StatisticManager>,
    inbounds: Vec<Arc<dyn inbound::InboundListener>>,
}

impl Gateway {
    /// Create a new Gateway from configuration
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing Mihomo Rust v{}", VERSION);

        // Initialize DNS resolver
        let dns_resolver = Arc::new(dns::Resolver::new(&config.dns).await?);
        info!("DNS resolver initialized");

        // Initialize statistic manager
        let statistic = Arc::new(statistic::StatisticManager::new());
        statistic.start_ticker();
        info!("Statistic manager initialized");

        // Initialize outbound proxies
        let proxies = outbound::ProxyManager::new(&config.proxies, dns_resolver.clone())?;
        info!("Loaded {} proxies", proxies.len());

        // Initialize rule engine
        let rule_engine = rule::RuleEngine::new(&config.rules)?;
        info!("Loaded {} rules", rule_engine.rule_count());

        // Initialize tunnel (with shared StatisticManager)
        let tunnel = Arc::new(tunnel::Tunnel::new(
            proxies,
            rule_engine,
            dns_resolver.clone(),
            statistic.clone(),
        ));

        // Initialize inbound listeners
        let mut inbounds: Vec<Arc<dyn inbound::InboundListener>> = Vec::new();

        // HTTP proxy
        if let Some(http_config) = &config.inbound.http {
            let listener = inbound::HttpListener::new(http_config.clone(), tunnel.clone())?;
            inbounds.push(Arc::new(listener));
            info!("HTTP proxy configured on {}", http_config.listen);
        }

        // SOCKS5 proxy
        if let Some(socks_config) = &config.inbound.socks {
            let listener = inbound::Socks5Listener::new(socks_config.clone(), tunnel.clone())?;
            inbounds.push(Arc::new(listener));
            info!("SOCKS5 proxy configured on {}", socks_config.listen);
        }

        // Mixed port
        if let Some(mixed_config) = &config.inbound.mixed {
            let listener = inbound::MixedListener::new(mixed_config.clone(), tunnel.clone())?;
            inbounds.push(Arc::new(listener));
            info!("Mixed proxy configured on {}", mixed_config.listen);
        }

        // V-LESS proxy
        if let Some(vless_config) = &config.inbound.vless {
            let listener = inbound::VlessListener::new(vless_config.clone(), tunnel.clone())?;
            inbounds.push(Arc::new(listener));
            info!("VLESS proxy configured on {}", vless_config.listen);
        }

        // V-MESS proxy
        if let Some(vmess_config) = &config.inbound.vmess {
            let listener = inbound::VmessListener::new(vmess_config.clone(), tunnel.clone())?;
            inbounds.push(Arc::new(listener));
            info!("VMess proxy configured on {}", vmess_config.listen);
        }

        Ok(Gateway {
            config: Arc::new(RwLock::new(config)),
            tunnel,
            dns_resolver,
            statistic,
            inbounds,
        })
    }

    /// Start all inbound listeners and block until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!("Starting gateway...");

        let mut handles = Vec::new();

        // Start inbound listeners
        for inbound in &self.inbounds {
            let inbound = inbound.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = inbound.start().await {
                    warn!("Inbound listener error: {}", e);
                }
            });
            handles.push(handle);
        }

        // Wait for shutdown signal
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        // Graceful shutdown
        for handle in handles {
            handle.abort();
        }

        info!("Gateway stopped");
        Ok(())
    }

    /// Get current configuration
    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Reload configuration
    pub async fn reload(&self, config: Config) -> Result<()> {
        let mut current = self.config.write().await;
        *current = config;
        // TODO: Hot reload proxies and rules
        Ok(())
    }

    /// Get tunnel reference
    pub fn tunnel(&self) -> &Arc<tunnel::Tunnel> {
        &self.tunnel
    }

    /// Get DNS resolver reference
    pub fn dns_resolver(&self) -> &Arc<dns::Resolver> {
        &self.dns_resolver
    }

    /// Get statistic manager reference
    pub fn statistic(&self) -> &Arc<statistic::StatisticManager> {
        &self.statistic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.10.0");
        assert!(META);
    }
}
