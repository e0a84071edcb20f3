//! Masking server
//!
//! Tracks clients by source address and fans cover traffic out to every live
//! client. Four loops share one socket: receive, send, cleanup and stats.
//! In advanced mode the send loop pulls from a [`StreamGenerator`];
//! otherwise it paces checksummed legacy packets with a byte accumulator.

use crate::config::ServerConfig;
use crate::legacy::{LegacyPacketGenerator, RatePatternGenerator};
use crate::net::{bind_udp, SocketConfig};
use crate::obfuscation::rate::mbps_to_bytes_per_sec;
use crate::obfuscation::{DynamicObfuscator, ObfuscationConfig, RateMode, StreamGenerator};
use crate::protocol::{ControlMessage, Inbound, MAX_DATAGRAM};
use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Packets sent per legacy pacing round at most
const LEGACY_BATCH: usize = 50;
/// Headroom added to the legacy byte budget
const LEGACY_HEADROOM: f64 = 1.1;
const LEGACY_ROUND_SLEEP: Duration = Duration::from_micros(500);
/// Advanced-mode delays are accumulated until they reach this much
const MIN_SLEEP_SECS: f64 = 0.001;
/// Largest burst the advanced send loop may use to catch up
const MAX_CATCH_UP_SECS: f64 = 0.05;

/// Per-address bookkeeping
#[derive(Debug, Clone, Copy)]
pub struct ClientRecord {
    pub last_seen: Instant,
    pub bytes_received: u64,
    pub packets_received: u64,
}

/// Clients keyed by source address
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: HashMap<SocketAddr, ClientRecord>,
}

impl ClientTable {
    /// Record a datagram of `len` bytes from `addr` seen at `now`
    ///
    /// Returns `true` when the address was not known before.
    pub fn touch(&mut self, addr: SocketAddr, len: usize, now: Instant) -> bool {
        let mut is_new = false;
        let record = self.clients.entry(addr).or_insert_with(|| {
            is_new = true;
            ClientRecord {
                last_seen: now,
                bytes_received: 0,
                packets_received: 0,
            }
        });
        record.last_seen = now;
        record.bytes_received += len as u64;
        record.packets_received += 1;
        is_new
    }

    /// Remove clients silent for longer than `timeout`, returning them
    pub fn evict_idle(&mut self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let stale: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            self.clients.remove(addr);
        }
        stale
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&ClientRecord> {
        self.clients.get(addr)
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// State shared by the server loops
struct Shared {
    socket: UdpSocket,
    clients: RwLock<ClientTable>,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    /// Legacy pattern name or advanced profile/header
    label: RwLock<String>,
}

impl Shared {
    /// Send one datagram to every address, counting what went out
    async fn fan_out(&self, data: &[u8], addrs: &[SocketAddr]) -> usize {
        let mut sent = 0;
        for addr in addrs {
            match self.socket.send_to(data, *addr).await {
                Ok(n) => {
                    sent += n;
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Send error to client {}: {}", addr, e),
            }
        }
        sent
    }
}

/// Read-only view of a running server
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub async fn client_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.shared.packets_sent.load(Ordering::Relaxed)
    }
}

/// UDP cover-traffic server
pub struct MaskingServer {
    config: ServerConfig,
    obfuscation: ObfuscationConfig,
    shared: Arc<Shared>,
}

impl MaskingServer {
    /// Bind the server socket
    ///
    /// # Arguments
    ///
    /// * `config` - Address, rate and loop settings
    /// * `obfuscation` - Validated here; used only in advanced mode
    /// * `socket` - Kernel buffer sizes
    pub async fn bind(
        config: ServerConfig,
        obfuscation: ObfuscationConfig,
        socket: &SocketConfig,
    ) -> anyhow::Result<Self> {
        let obfuscation = obfuscation.validated()?;
        // Reject a bad rate range before anything is bound
        rate_mode(&config)?;

        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", config.bind_address, config.port))?;
        let socket = bind_udp(addr, socket)?;

        Ok(Self {
            config,
            obfuscation,
            shared: Arc::new(Shared {
                socket,
                clients: RwLock::new(ClientTable::default()),
                bytes_sent: AtomicU64::new(0),
                packets_sent: AtomicU64::new(0),
                label: RwLock::new(String::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run all loops until `shutdown` fires
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!("Traffic masking server started on {}", addr);
        match self.config.floating_range() {
            Some((min, max)) => info!("Floating throughput: {}-{} Mbps", min, max),
            None => info!("Target throughput: {} Mbps", self.config.target_mbps),
        }
        if self.config.advanced {
            info!(
                "Advanced mode enabled: profile={}, header={}, padding={}, mtu={}, entropy={}",
                self.config.profile,
                self.obfuscation.header_mode,
                self.obfuscation.padding_strategy,
                self.obfuscation.mtu,
                self.obfuscation.entropy
            );
        }

        let mut tasks = JoinSet::new();

        let shared = self.shared.clone();
        let mut rx = shutdown.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = receive_loop(&shared) => {}
                _ = rx.recv() => {}
            }
        });

        let shared = self.shared.clone();
        let mut rx = shutdown.subscribe();
        let config = self.config.clone();
        let obfuscation = self.obfuscation.clone();
        tasks.spawn(async move {
            let send = async {
                if config.advanced {
                    advanced_send_loop(&shared, &config, obfuscation).await
                } else {
                    legacy_send_loop(&shared, &config).await
                }
            };
            tokio::select! {
                result = send => {
                    if let Err(e) = result {
                        error!("Send loop stopped: {}", e);
                    }
                }
                _ = rx.recv() => {}
            }
        });

        let shared = self.shared.clone();
        let mut rx = shutdown.subscribe();
        let config = self.config.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = cleanup_loop(&shared, &config) => {}
                _ = rx.recv() => {}
            }
        });

        let shared = self.shared.clone();
        let mut rx = shutdown.subscribe();
        let interval = self.config.stats_interval();
        tasks.spawn(async move {
            tokio::select! {
                _ = stats_loop(&shared, interval) => {}
                _ = rx.recv() => {}
            }
        });

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Server task join error: {}", e);
            }
        }
        info!("Traffic masking server stopped");
        Ok(())
    }
}

fn rate_mode(config: &ServerConfig) -> anyhow::Result<RateMode> {
    let (min, max) = config.floating_range().unzip();
    Ok(RateMode::from_options(Some(config.target_mbps), min, max)?)
}

/// Legacy path base rate: midpoint of a floating range, else the target
fn legacy_base_mbps(config: &ServerConfig) -> f64 {
    match config.floating_range() {
        Some((min, max)) => (min + max) / 2.0,
        None => config.target_mbps,
    }
}

async fn receive_loop(shared: &Shared) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((n, addr)) => {
                let is_new = shared.clients.write().await.touch(addr, n, Instant::now());
                if is_new {
                    info!("New client connected: {}", addr);
                }
                match Inbound::classify(&buf[..n]) {
                    Inbound::Control(ControlMessage::InitClient) => debug!("Registration from {}", addr),
                    Inbound::Control(ControlMessage::Keepalive) => debug!("Keepalive from {}", addr),
                    Inbound::Response(packet) => debug!(seq = packet.sequence, len = n, "Response from {}", addr),
                    Inbound::Opaque(len) => debug!(len, "Datagram from {}", addr),
                }
            }
            Err(e) => {
                warn!("Receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn advanced_send_loop(
    shared: &Shared,
    config: &ServerConfig,
    obfuscation: ObfuscationConfig,
) -> anyhow::Result<()> {
    let build = || -> anyhow::Result<StreamGenerator> {
        Ok(StreamGenerator::new(
            config.profile,
            rate_mode(config)?,
            DynamicObfuscator::new(obfuscation.clone()),
            obfuscation.entropy,
        ))
    };
    let mut generator = build()?;
    *shared.label.write().await = format!("advanced:{}/{}", config.profile, obfuscation.header_mode);

    // seconds still owed to the pacing schedule
    let mut debt = 0.0f64;
    loop {
        let addrs = shared.clients.read().await.addresses();
        if addrs.is_empty() {
            debt = 0.0;
            tokio::time::sleep(config.idle_poll()).await;
            continue;
        }

        let (fragments, delay) = match generator.next() {
            Some(item) => item,
            None => {
                warn!("Stream generator stopped, rebuilding");
                generator = build()?;
                continue;
            }
        };
        for fragment in &fragments {
            shared.fan_out(fragment, &addrs).await;
        }

        debt += delay;
        if debt >= MIN_SLEEP_SECS {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_secs_f64(debt)).await;
            debt = (debt - started.elapsed().as_secs_f64()).max(-MAX_CATCH_UP_SECS);
        }
    }
}

async fn legacy_send_loop(shared: &Shared, config: &ServerConfig) -> anyhow::Result<()> {
    let base_rate = mbps_to_bytes_per_sec(legacy_base_mbps(config));
    let mut patterns = RatePatternGenerator::new();
    let mut packets = LegacyPacketGenerator::new();
    let mut rng = StdRng::from_entropy();
    let started = Instant::now();
    let mut last_send = Instant::now();
    let mut accumulator = 0.0f64;
    let mut label = String::new();

    loop {
        let addrs = shared.clients.read().await.addresses();
        if addrs.is_empty() {
            accumulator = 0.0;
            tokio::time::sleep(config.idle_poll()).await;
            last_send = Instant::now();
            continue;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_send).as_secs_f64();
        let rate = patterns.rate_at(base_rate, started.elapsed().as_secs_f64());
        if patterns.current().as_str() != label {
            label = patterns.current().to_string();
            *shared.label.write().await = label.clone();
        }

        accumulator += rate * elapsed * LEGACY_HEADROOM;
        let mut round = 0;
        while accumulator > 0.0 && round < LEGACY_BATCH {
            let want = (accumulator as usize).min(rng.gen_range(1000..=1400));
            let bytes = packets.generate(Some(want)).to_bytes();
            shared.fan_out(&bytes, &addrs).await;
            accumulator -= bytes.len() as f64;
            round += 1;
            if round % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        last_send = now;

        if accumulator > rate * 0.1 {
            // behind schedule
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(LEGACY_ROUND_SLEEP).await;
        }
    }
}

async fn cleanup_loop(shared: &Shared, config: &ServerConfig) {
    loop {
        let evicted = shared
            .clients
            .write()
            .await
            .evict_idle(Instant::now(), config.client_timeout());
        for addr in evicted {
            info!("Client removed (inactive): {}", addr);
        }
        tokio::time::sleep(config.cleanup_interval()).await;
    }
}

async fn stats_loop(shared: &Shared, interval: Duration) {
    let mut last_bytes = shared.bytes_sent.load(Ordering::Relaxed);
    let mut last_packets = shared.packets_sent.load(Ordering::Relaxed);
    let mut last_time = Instant::now();
    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let bytes = shared.bytes_sent.load(Ordering::Relaxed);
        let packets = shared.packets_sent.load(Ordering::Relaxed);
        let dt = now.duration_since(last_time).as_secs_f64();

        if dt > 0.0 {
            let mbps = (bytes - last_bytes) as f64 * 8.0 / (dt * 1024.0 * 1024.0);
            let pps = (packets - last_packets) as f64 / dt;
            let clients = shared.clients.read().await.len();
            let label = shared.label.read().await.clone();
            info!(
                target: "trafmask::stats",
                "[STATS] Clients: {} | Rate: {:.2} Mbps | PPS: {:.0} | Pattern: {}",
                clients,
                mbps,
                pps,
                label
            );
        }

        last_bytes = bytes;
        last_packets = packets;
        last_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AdaptiveClient, ClientSettings};
    use crate::config::ClientConfig;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_touch_tracks_counters() {
        let mut table = ClientTable::default();
        let t0 = Instant::now();
        assert!(table.touch(addr(1000), 11, t0));
        assert!(!table.touch(addr(1000), 9, t0 + Duration::from_secs(1)));
        let record = table.get(&addr(1000)).unwrap();
        assert_eq!(record.bytes_received, 20);
        assert_eq!(record.packets_received, 2);
        assert_eq!(record.last_seen, t0 + Duration::from_secs(1));
    }

    #[test]
    fn test_eviction_boundary() {
        let mut table = ClientTable::default();
        let t0 = Instant::now();
        table.touch(addr(1000), 1, t0);
        let timeout = Duration::from_secs(30);

        assert!(table.evict_idle(t0 + Duration::from_secs(29), timeout).is_empty());
        assert_eq!(table.len(), 1);

        let evicted = table.evict_idle(t0 + Duration::from_secs(31), timeout);
        assert_eq!(evicted, vec![addr(1000)]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_legacy_base_rate() {
        let mut config = ServerConfig::default();
        config.target_mbps = 2.0;
        assert_eq!(legacy_base_mbps(&config), 2.0);
        config.min_mbps = Some(1.0);
        config.max_mbps = Some(5.0);
        assert_eq!(legacy_base_mbps(&config), 3.0);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_range() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            min_mbps: Some(5.0),
            max_mbps: Some(1.0),
            ..Default::default()
        };
        let result = MaskingServer::bind(config, ObfuscationConfig::default(), &SocketConfig::default()).await;
        assert!(result.is_err());
    }

    async fn run_pair(advanced: bool) -> (usize, u64) {
        let server_config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            target_mbps: 2.0,
            advanced,
            ..Default::default()
        };
        let server = MaskingServer::bind(server_config, ObfuscationConfig::default(), &SocketConfig::default())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let handle = server.handle();

        let (shutdown_tx, _) = broadcast::channel(1);
        let server_task = tokio::spawn(server.run(shutdown_tx.clone()));

        let client_config = ClientConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: server_addr.port(),
            ..Default::default()
        };
        let settings = ClientSettings::builder(client_config).build().unwrap();
        let client = AdaptiveClient::connect(settings, &SocketConfig::default()).await.unwrap();
        let client_task = tokio::spawn(client.run(shutdown_tx.clone()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let clients = handle.client_count().await;
        let bytes = handle.bytes_sent();

        let _ = shutdown_tx.send(());
        let _ = server_task.await;
        let _ = client_task.await;
        (clients, bytes)
    }

    #[tokio::test]
    async fn test_end_to_end_legacy() {
        let (clients, bytes) = run_pair(false).await;
        assert_eq!(clients, 1);
        assert!(bytes > 0);
    }

    #[tokio::test]
    async fn test_end_to_end_advanced() {
        let (clients, bytes) = run_pair(true).await;
        assert_eq!(clients, 1);
        assert!(bytes > 0);
    }
}
