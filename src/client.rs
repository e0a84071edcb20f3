//! Adaptive masking client
//!
//! Registers with a masking server, measures the inbound rate and answers
//! with uplink traffic proportional to it. Keepalives hold the registration
//! open; prolonged silence triggers a reconnect on a fresh socket with
//! exponential backoff.

use crate::config::ClientConfig;
use crate::net::{bind_udp, unspecified_for, SocketConfig};
use crate::obfuscation::{CorrelationBreaker, DynamicObfuscator, ObfuscationConfig};
use crate::profile::TrafficProfile;
use crate::protocol::{now_micros, ControlMessage, ResponsePacket, MAX_DATAGRAM, RESPONSE_HEADER_LEN};
use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Send loop frequency
const SEND_TICKS_PER_SEC: f64 = 100.0;
const BURST_PROBABILITY: f64 = 0.05;
const ECHO_PROBABILITY: f64 = 0.01;
/// Receive-rate windows kept for the average
const RATE_HISTORY: usize = 10;
const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Upper bound on the send budget accrued between two ticks
const MAX_SEND_CATCHUP: f64 = 0.1;

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_addr: SocketAddr,
    pub config: ClientConfig,
    pub obfuscation: ObfuscationConfig,
}

impl ClientSettings {
    /// Start from a file configuration
    pub fn builder(config: ClientConfig) -> ClientSettingsBuilder {
        ClientSettingsBuilder {
            config,
            obfuscation: ObfuscationConfig::default(),
        }
    }
}

/// Builder for [`ClientSettings`]
pub struct ClientSettingsBuilder {
    config: ClientConfig,
    obfuscation: ObfuscationConfig,
}

impl ClientSettingsBuilder {
    /// Set the obfuscation used for uplink packets in advanced mode
    pub fn obfuscation(mut self, obfuscation: ObfuscationConfig) -> Self {
        self.obfuscation = obfuscation;
        self
    }

    /// Set the uplink rate as a fraction of the inbound rate
    pub fn response_ratio(mut self, ratio: f64) -> Self {
        self.config.response_ratio = ratio;
        self
    }

    pub fn advanced(mut self, advanced: bool) -> Self {
        self.config.advanced = advanced;
        self
    }

    pub fn uplink_profile(mut self, profile: TrafficProfile) -> Self {
        self.config.uplink_profile = profile;
        self
    }

    /// Validate and resolve the server address
    pub fn build(self) -> anyhow::Result<ClientSettings> {
        if !(0.0..=1.0).contains(&self.config.response_ratio) {
            return Err(anyhow!(
                "Response ratio must be within 0.0-1.0 (got {})",
                self.config.response_ratio
            ));
        }
        if self.config.reconnect_min_secs == 0 || self.config.reconnect_max_secs < self.config.reconnect_min_secs {
            return Err(anyhow!("Reconnect backoff must satisfy 0 < min <= max"));
        }
        let obfuscation = self.obfuscation.validated()?;
        let server_addr = (self.config.server_host.as_str(), self.config.server_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("Could not resolve {}:{}", self.config.server_host, self.config.server_port))?;

        Ok(ClientSettings {
            server_addr,
            config: self.config,
            obfuscation,
        })
    }
}

/// Inbound rate measured over one-second windows
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    current_mbps: f64,
    history: VecDeque<f64>,
}

impl RateWindow {
    /// Close a window that saw `bytes` over `elapsed`
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        self.current_mbps = bytes as f64 * 8.0 / (secs * 1024.0 * 1024.0);
        self.history.push_back(self.current_mbps);
        while self.history.len() > RATE_HISTORY {
            self.history.pop_front();
        }
    }

    pub fn current_mbps(&self) -> f64 {
        self.current_mbps
    }

    pub fn average_mbps(&self) -> f64 {
        if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        }
    }

    pub fn reset(&mut self) {
        self.current_mbps = 0.0;
        self.history.clear();
    }
}

/// Reconnect delays doubling from `min` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

/// Silence tracking against the most recent registration
///
/// A registration restarts the silence clock but does not prove the server
/// is alive; only inbound data does.
#[derive(Debug, Clone)]
pub struct Liveness {
    registered_at: Instant,
    last_received: Option<Instant>,
    heard_since_registration: bool,
}

impl Liveness {
    pub fn new(now: Instant) -> Self {
        Self {
            registered_at: now,
            last_received: None,
            heard_since_registration: false,
        }
    }

    pub fn registered(&mut self, now: Instant) {
        self.registered_at = now;
        self.heard_since_registration = false;
    }

    pub fn received(&mut self, now: Instant) {
        self.last_received = Some(now);
        self.heard_since_registration = true;
    }

    /// Time since the later of the last registration and the last datagram
    pub fn silent_for(&self, now: Instant) -> Duration {
        let since = match self.last_received {
            Some(received) if received > self.registered_at => received,
            _ => self.registered_at,
        };
        now.saturating_duration_since(since)
    }

    /// Whether the server has sent anything since the last registration
    pub fn confirmed(&self) -> bool {
        self.heard_since_registration
    }
}

/// Builds and disguises uplink packets
pub struct Uplink {
    profile: TrafficProfile,
    obfuscator: Option<DynamicObfuscator>,
    correlation: CorrelationBreaker,
    rng: StdRng,
}

impl Uplink {
    pub fn new(advanced: bool, obfuscation: ObfuscationConfig, profile: TrafficProfile) -> Self {
        Self::with_rng(advanced, obfuscation, profile, StdRng::from_entropy())
    }

    pub fn with_rng(advanced: bool, obfuscation: ObfuscationConfig, profile: TrafficProfile, mut rng: StdRng) -> Self {
        let obfuscator = advanced.then(|| DynamicObfuscator::with_rng(obfuscation, child_rng(&mut rng)));
        let correlation = CorrelationBreaker::with_rng(child_rng(&mut rng));
        Self {
            profile,
            obfuscator,
            correlation,
            rng,
        }
    }

    pub fn is_advanced(&self) -> bool {
        self.obfuscator.is_some()
    }

    /// Size of the next packet in a send budget with `remaining` bytes left
    pub fn next_size(&mut self, remaining: usize) -> usize {
        let base = self.rng.gen_range(200..=1000);
        let size = if self.is_advanced() {
            self.correlation.get_correlated_size(base, self.profile)
        } else {
            base
        };
        remaining.min(size)
    }

    /// Response packet of `size` total bytes, or a random ACK/medium/large size
    pub fn response_packet(&mut self, sequence: u32, size: Option<usize>) -> ResponsePacket {
        let size = size.unwrap_or_else(|| {
            let (lo, hi) = [(64, 200), (200, 600), (600, 1200)][self.rng.gen_range(0..3)];
            self.rng.gen_range(lo..=hi)
        });
        let mut payload = vec![0u8; size.saturating_sub(RESPONSE_HEADER_LEN)];
        self.rng.fill_bytes(&mut payload);
        ResponsePacket::new(sequence, now_micros(), payload)
    }

    /// Datagrams to send for `packet`, and the delay to wait before them
    pub fn prepare(&mut self, packet: Vec<u8>) -> (Vec<Vec<u8>>, f64) {
        match self.obfuscator.as_mut() {
            Some(obfuscator) => obfuscator.obfuscate(&packet, Some(self.profile), 0.0),
            None => (vec![packet], 0.0),
        }
    }

    fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p)
    }

    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        self.rng.gen_range(lo..hi)
    }
}

/// Cumulative counters at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub average_mbps: f64,
    pub connected: bool,
}

impl ClientStats {
    /// `(rx_mbps, rx_pps, tx_mbps, tx_pps)` averaged over `elapsed`
    pub fn rates(&self, elapsed: Duration) -> (f64, f64, f64, f64) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let mbps = |bytes: u64| bytes as f64 * 8.0 / (secs * 1024.0 * 1024.0);
        (
            mbps(self.bytes_received),
            self.packets_received as f64 / secs,
            mbps(self.bytes_sent),
            self.packets_sent as f64 / secs,
        )
    }
}

struct ClientShared {
    settings: ClientSettings,
    socket_config: SocketConfig,
    /// Replaced wholesale on reconnect
    socket: RwLock<Arc<UdpSocket>>,
    connected: AtomicBool,
    liveness: Mutex<Liveness>,
    rates: RwLock<RateWindow>,
    uplink: Mutex<Uplink>,
    sequence: AtomicU32,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
}

impl ClientShared {
    async fn socket(&self) -> Arc<UdpSocket> {
        self.socket.read().await.clone()
    }

    async fn register(&self) -> anyhow::Result<()> {
        let socket = self.socket().await;
        match socket
            .send_to(ControlMessage::InitClient.as_bytes(), self.settings.server_addr)
            .await
        {
            Ok(_) => {
                self.connected.store(true, Ordering::Relaxed);
                self.liveness.lock().await.registered(Instant::now());
                info!("Registration sent to {}", self.settings.server_addr);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(anyhow!("Registration failed: {}", e))
            }
        }
    }

    async fn replace_socket(&self) -> anyhow::Result<()> {
        let fresh = bind_udp(unspecified_for(&self.settings.server_addr), &self.socket_config)?;
        *self.socket.write().await = Arc::new(fresh);
        Ok(())
    }

    /// Obfuscate if enabled and send at once
    ///
    /// Returns the obfuscator delay; pacing it is up to the caller.
    async fn send_packet(&self, packet: ResponsePacket) -> Duration {
        let (datagrams, delay) = self.uplink.lock().await.prepare(packet.to_bytes());
        let socket = self.socket().await;
        for datagram in &datagrams {
            match socket.send_to(datagram, self.settings.server_addr).await {
                Ok(n) => {
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Send error: {}", e),
            }
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn stats(&self) -> ClientStats {
        ClientStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            average_mbps: self.rates.read().await.average_mbps(),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    pub async fn stats(&self) -> ClientStats {
        self.shared.stats().await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

/// UDP client answering cover traffic with uplink traffic
pub struct AdaptiveClient {
    shared: Arc<ClientShared>,
}

impl AdaptiveClient {
    /// Bind a socket and register with the server
    ///
    /// A failed registration is logged; the keepalive loop retries it.
    pub async fn connect(settings: ClientSettings, socket_config: &SocketConfig) -> anyhow::Result<Self> {
        let socket = bind_udp(unspecified_for(&settings.server_addr), socket_config)?;
        info!("Traffic masking client connecting to {}", settings.server_addr);
        if settings.config.advanced {
            info!(
                "Advanced client mode: uplink_profile={}, header={}, padding={}, mtu={}, entropy={}",
                settings.config.uplink_profile,
                settings.obfuscation.header_mode,
                settings.obfuscation.padding_strategy,
                settings.obfuscation.mtu,
                settings.obfuscation.entropy
            );
        }

        let uplink = Uplink::new(
            settings.config.advanced,
            settings.obfuscation.clone(),
            settings.config.uplink_profile,
        );
        let shared = Arc::new(ClientShared {
            settings,
            socket_config: socket_config.clone(),
            socket: RwLock::new(Arc::new(socket)),
            connected: AtomicBool::new(false),
            liveness: Mutex::new(Liveness::new(Instant::now())),
            rates: RwLock::new(RateWindow::default()),
            uplink: Mutex::new(uplink),
            sequence: AtomicU32::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
        });

        if let Err(e) = shared.register().await {
            warn!("{}", e);
        }
        Ok(Self { shared })
    }

    pub async fn stats(&self) -> ClientStats {
        self.shared.stats().await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Handle for observing the client after [`AdaptiveClient::run`] takes it
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run all loops until `shutdown` fires
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
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
        tasks.spawn(async move {
            tokio::select! {
                _ = send_loop(&shared) => {}
                _ = rx.recv() => {}
            }
        });

        let shared = self.shared.clone();
        let mut rx = shutdown.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = keepalive_loop(&shared) => {}
                _ = rx.recv() => {}
            }
        });

        let shared = self.shared.clone();
        let mut rx = shutdown.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = stats_loop(&shared) => {}
                _ = rx.recv() => {}
            }
        });

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Client task join error: {}", e);
            }
        }
        info!("Traffic masking client stopped");
        Ok(())
    }
}

async fn receive_loop(shared: &ClientShared) {
    let timeout = Duration::from_secs(shared.settings.config.socket_timeout_secs);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut rng = StdRng::from_entropy();
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    loop {
        let socket = shared.socket().await;
        let (n, _) = match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!("Receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Ok(Ok(received)) => received,
        };

        let now = Instant::now();
        shared.liveness.lock().await.received(now);
        shared.connected.store(true, Ordering::Relaxed);
        shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        shared.packets_received.fetch_add(1, Ordering::Relaxed);

        window_bytes += n as u64;
        let elapsed = now.duration_since(window_start);
        if elapsed >= RATE_WINDOW {
            shared.rates.write().await.record(window_bytes, elapsed);
            window_start = now;
            window_bytes = 0;
        }

        // Echo goes out immediately; its obfuscator delay is dropped
        if rng.gen_bool(ECHO_PROBABILITY) {
            let sequence = shared.next_sequence();
            let echo = shared.uplink.lock().await.response_packet(sequence, Some(n / 4));
            shared.send_packet(echo).await;
        }
    }
}

/// Each tick spends the uplink rate times the wall time since the previous
/// tick, capped at `MAX_SEND_CATCHUP`.
async fn send_loop(shared: &ClientShared) {
    let tick = Duration::from_secs_f64(1.0 / SEND_TICKS_PER_SEC);
    let ratio = shared.settings.config.response_ratio;
    let mut last_tick = Instant::now();
    loop {
        let now = Instant::now();
        let elapsed = now.duration_since(last_tick).as_secs_f64().min(MAX_SEND_CATCHUP);
        last_tick = now;

        let received_mbps = shared.rates.read().await.current_mbps();
        if received_mbps > 0.0 {
            let mut target = received_mbps * ratio * 1024.0 * 1024.0 / 8.0;
            let mut remaining = {
                let mut uplink = shared.uplink.lock().await;
                if uplink.chance(BURST_PROBABILITY) {
                    target *= uplink.uniform(1.5, 3.0);
                }
                (target * elapsed) as usize
            };

            while remaining > 0 {
                let sequence = shared.next_sequence();
                let (packet, gap) = {
                    let mut uplink = shared.uplink.lock().await;
                    let size = uplink.next_size(remaining);
                    (uplink.response_packet(sequence, Some(size)), uplink.uniform(0.001, 0.005))
                };
                let len = packet.to_bytes().len();
                let delay = shared.send_packet(packet).await;
                remaining = remaining.saturating_sub(len);
                tokio::time::sleep(delay + Duration::from_secs_f64(gap)).await;
            }
        }
        tokio::time::sleep(tick).await;
    }
}

async fn keepalive_loop(shared: &ClientShared) {
    let config = &shared.settings.config;
    let interval = Duration::from_secs(config.keepalive_interval_secs);
    let receive_timeout = Duration::from_secs(config.receive_timeout_secs);
    let mut backoff = Backoff::new(
        Duration::from_secs(config.reconnect_min_secs),
        Duration::from_secs(config.reconnect_max_secs),
    );

    loop {
        tokio::time::sleep(interval).await;

        let socket = shared.socket().await;
        if let Err(e) = socket
            .send_to(ControlMessage::Keepalive.as_bytes(), shared.settings.server_addr)
            .await
        {
            debug!("Keepalive send failed: {}", e);
        }

        let (silent_for, confirmed) = {
            let liveness = shared.liveness.lock().await;
            (liveness.silent_for(Instant::now()), liveness.confirmed())
        };
        if silent_for <= receive_timeout {
            // Only real inbound data ends a run of failed reconnects
            if confirmed {
                backoff.reset();
            }
            continue;
        }

        warn!("Connection lost (no data for {:.1}s), reconnecting...", silent_for.as_secs_f64());
        shared.connected.store(false, Ordering::Relaxed);
        shared.rates.write().await.reset();
        reconnect(shared, &mut backoff).await;
    }
}

/// Retry on fresh sockets until a registration goes out
async fn reconnect(shared: &ClientShared, backoff: &mut Backoff) {
    loop {
        let delay = backoff.next_delay();
        info!("Reconnecting in {:.1}s...", delay.as_secs_f64());
        tokio::time::sleep(delay).await;

        let attempt = async {
            shared.replace_socket().await?;
            shared.register().await
        };
        match attempt.await {
            Ok(()) => {
                info!("Reconnected successfully");
                shared.rates.write().await.reset();
                return;
            }
            Err(e) => warn!("Reconnect failed: {}", e),
        }
    }
}

async fn stats_loop(shared: &ClientShared) {
    let interval = Duration::from_secs_f64(shared.settings.config.stats_interval_secs);
    let started = Instant::now();
    loop {
        tokio::time::sleep(interval).await;
        let stats = shared.stats().await;
        let (rx_mbps, rx_pps, tx_mbps, tx_pps) = stats.rates(started.elapsed());
        info!(
            target: "trafmask::stats",
            "[STATS] Rx: {:.2} Mbps ({:.0} pps) | Tx: {:.2} Mbps ({:.0} pps) | Avg rate: {:.2} Mbps | Status: {}",
            rx_mbps,
            rx_pps,
            tx_mbps,
            tx_pps,
            stats.average_mbps,
            if stats.connected { "connected" } else { "disconnected" }
        );
    }
}

fn child_rng(rng: &mut StdRng) -> StdRng {
    StdRng::from_rng(rng).unwrap_or_else(|_| StdRng::from_entropy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::{HeaderMode, PaddingStrategy};
    use crate::protocol::{Inbound, INIT_CLIENT};

    fn local_config(port: u16) -> ClientConfig {
        ClientConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: port,
            ..Default::default()
        }
    }

    #[test]
    fn test_builder_validation() {
        assert!(ClientSettings::builder(local_config(8888)).response_ratio(1.5).build().is_err());

        let bad_obf = ObfuscationConfig {
            entropy: 2.0,
            ..Default::default()
        };
        assert!(ClientSettings::builder(local_config(8888)).obfuscation(bad_obf).build().is_err());

        let settings = ClientSettings::builder(local_config(8888))
            .advanced(true)
            .uplink_profile(TrafficProfile::Voip)
            .build()
            .unwrap();
        assert_eq!(settings.server_addr, "127.0.0.1:8888".parse::<SocketAddr>().unwrap());
        assert!(settings.config.advanced);
        assert_eq!(settings.config.uplink_profile, TrafficProfile::Voip);
    }

    #[test]
    fn test_rate_window() {
        let mut window = RateWindow::default();
        assert_eq!(window.average_mbps(), 0.0);
        // 131072 bytes over one second is exactly 1 Mbps
        window.record(131_072, Duration::from_secs(1));
        assert!((window.current_mbps() - 1.0).abs() < 1e-12);
        for _ in 0..20 {
            window.record(262_144, Duration::from_secs(1));
        }
        assert_eq!(window.history.len(), RATE_HISTORY);
        assert!((window.average_mbps() - 2.0).abs() < 1e-12);
        window.reset();
        assert_eq!(window.current_mbps(), 0.0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_response_packet_sizes() {
        let mut uplink = Uplink::with_rng(false, ObfuscationConfig::default(), TrafficProfile::Web, StdRng::seed_from_u64(1));
        let packet = uplink.response_packet(5, Some(300));
        assert_eq!(packet.to_bytes().len(), 300);
        assert_eq!(packet.sequence, 5);

        // smaller than the header still yields a bare header
        assert_eq!(uplink.response_packet(6, Some(4)).to_bytes().len(), RESPONSE_HEADER_LEN);

        for i in 0..500 {
            let len = uplink.response_packet(i, None).to_bytes().len();
            assert!((64..=1200).contains(&len));
        }
    }

    #[test]
    fn test_next_size_respects_budget() {
        let mut plain = Uplink::with_rng(false, ObfuscationConfig::default(), TrafficProfile::File, StdRng::seed_from_u64(2));
        for _ in 0..500 {
            let size = plain.next_size(5_000);
            assert!((200..=1000).contains(&size));
        }
        assert_eq!(plain.next_size(50), 50);

        let mut advanced = Uplink::with_rng(true, ObfuscationConfig::default(), TrafficProfile::File, StdRng::seed_from_u64(3));
        for _ in 0..500 {
            assert!(advanced.next_size(150) <= 150);
        }
    }

    #[test]
    fn test_prepare_plain_and_advanced() {
        let mut plain = Uplink::with_rng(false, ObfuscationConfig::default(), TrafficProfile::Web, StdRng::seed_from_u64(4));
        let (datagrams, delay) = plain.prepare(vec![1u8; 500]);
        assert_eq!(datagrams, vec![vec![1u8; 500]]);
        assert_eq!(delay, 0.0);

        let config = ObfuscationConfig {
            padding_strategy: PaddingStrategy::FixedBuckets,
            header_mode: HeaderMode::RtpLike,
            ..Default::default()
        };
        let mut advanced = Uplink::with_rng(true, config, TrafficProfile::Voip, StdRng::seed_from_u64(5));
        let (datagrams, delay) = advanced.prepare(vec![1u8; 100]);
        assert_eq!(datagrams.iter().map(Vec::len).sum::<usize>(), 128);
        assert!(delay > 0.0 && delay <= 0.01);
    }

    #[test]
    fn test_stats_rates() {
        let stats = ClientStats {
            bytes_received: 1_310_720,
            packets_received: 100,
            bytes_sent: 131_072,
            packets_sent: 10,
            ..Default::default()
        };
        let (rx, rx_pps, tx, tx_pps) = stats.rates(Duration::from_secs(10));
        assert!((rx - 1.0).abs() < 1e-12);
        assert!((rx_pps - 10.0).abs() < 1e-12);
        assert!((tx - 0.1).abs() < 1e-12);
        assert!((tx_pps - 1.0).abs() < 1e-12);
        assert_eq!(stats.rates(Duration::ZERO), (0.0, 0.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn test_connect_registers_with_server() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let port = server.local_addr().unwrap().port();
        let settings = ClientSettings::builder(local_config(port)).build().unwrap();

        let client = AdaptiveClient::connect(settings, &SocketConfig::default()).await.unwrap();
        assert!(client.is_connected());

        let mut buf = [0u8; 64];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"INIT_CLIENT");
    }

    #[test]
    fn test_liveness_requires_data_after_registration() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0);
        assert!(!liveness.confirmed());
        assert_eq!(liveness.silent_for(t0 + Duration::from_secs(4)), Duration::from_secs(4));

        liveness.received(t0 + Duration::from_secs(1));
        assert!(liveness.confirmed());
        assert_eq!(liveness.silent_for(t0 + Duration::from_secs(4)), Duration::from_secs(3));

        // a fresh registration restarts the clock but needs new data to confirm
        liveness.registered(t0 + Duration::from_secs(5));
        assert!(!liveness.confirmed());
        assert_eq!(liveness.silent_for(t0 + Duration::from_secs(6)), Duration::from_secs(1));
        assert_eq!(liveness.silent_for(t0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_reconnect_backs_off_on_fresh_sockets() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let port = server.local_addr().unwrap().port();
        let config = ClientConfig {
            keepalive_interval_secs: 2,
            receive_timeout_secs: 3,
            reconnect_min_secs: 1,
            reconnect_max_secs: 30,
            ..local_config(port)
        };
        let settings = ClientSettings::builder(config).build().unwrap();

        let started = Instant::now();
        let client = AdaptiveClient::connect(settings, &SocketConfig::default()).await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let running = tokio::spawn(client.run(shutdown.clone()));

        // The server never answers: registrations land near 0s, 5s and 11s
        let mut registrations = Vec::new();
        let mut buf = [0u8; 2048];
        while registrations.len() < 3 {
            let (n, from) = tokio::time::timeout(Duration::from_secs(20), server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if &buf[..n] == INIT_CLIENT {
                registrations.push((started.elapsed().as_secs_f64(), from));
            }
        }
        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();

        let first_gap = registrations[1].0 - registrations[0].0;
        let second_gap = registrations[2].0 - registrations[1].0;
        assert!(first_gap > 4.0, "first gap {:.2}s", first_gap);
        assert!(second_gap > first_gap + 0.5, "gaps {:.2}s then {:.2}s", first_gap, second_gap);
        assert_ne!(registrations[1].1, registrations[0].1);
        assert_ne!(registrations[2].1, registrations[1].1);
    }

    #[tokio::test]
    async fn test_uplink_follows_inbound_rate() {
        let server = Arc::new(bind_udp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap());
        let port = server.local_addr().unwrap().port();
        let settings = ClientSettings::builder(local_config(port)).response_ratio(0.3).build().unwrap();
        let client = AdaptiveClient::connect(settings, &SocketConfig::default()).await.unwrap();
        let handle = client.handle();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let running = tokio::spawn(client.run(shutdown.clone()));

        // 1000-byte datagrams every 5ms, about 1.5 Mbps
        let sent = Arc::new(AtomicU64::new(0));
        let sender = {
            let server = server.clone();
            let sent = sent.clone();
            tokio::spawn(async move {
                let datagram = vec![0xA5u8; 1000];
                let mut ticker = tokio::time::interval(Duration::from_millis(5));
                loop {
                    ticker.tick().await;
                    if let Ok(n) = server.send_to(&datagram, client_addr).await {
                        sent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
            })
        };

        let started = Instant::now();
        let measure_from = Duration::from_secs(2);
        let measure_until = Duration::from_secs(5);
        let mut inbound_start = None;
        let mut uplink = 0u64;
        loop {
            let left = measure_until.saturating_sub(started.elapsed());
            if left.is_zero() {
                break;
            }
            let Ok(received) = tokio::time::timeout(left, server.recv_from(&mut buf)).await else {
                break;
            };
            let (n, _) = received.unwrap();
            if started.elapsed() < measure_from {
                continue;
            }
            inbound_start.get_or_insert_with(|| sent.load(Ordering::Relaxed));
            if matches!(Inbound::classify(&buf[..n]), Inbound::Response(_)) {
                uplink += n as u64;
            }
        }
        let inbound = sent.load(Ordering::Relaxed) - inbound_start.unwrap();

        let stats = handle.stats().await;
        assert!(stats.connected);
        assert!(handle.is_connected());
        assert!(stats.average_mbps > 1.0 && stats.average_mbps < 2.0, "{}", stats.average_mbps);

        sender.abort();
        shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();

        let ratio = uplink as f64 / inbound as f64;
        assert!(ratio > 0.2 && ratio < 0.45, "uplink/inbound {:.3}", ratio);
    }

    #[tokio::test]
    async fn test_send_packet_leaves_delay_to_caller() {
        let server = bind_udp("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let port = server.local_addr().unwrap().port();
        let obfuscation = ObfuscationConfig {
            header_mode: HeaderMode::RtpLike,
            ..Default::default()
        };
        let settings = ClientSettings::builder(local_config(port))
            .advanced(true)
            .obfuscation(obfuscation)
            .build()
            .unwrap();
        let client = AdaptiveClient::connect(settings, &SocketConfig::default()).await.unwrap();

        let started = Instant::now();
        let mut owed = Duration::ZERO;
        for sequence in 0..50 {
            let packet = client.shared.uplink.lock().await.response_packet(sequence, Some(200));
            owed += client.shared.send_packet(packet).await;
        }
        assert!(owed > Duration::ZERO);
        assert!(started.elapsed() < owed, "slept {:?} of {:?}", started.elapsed(), owed);
        assert!(client.stats().await.packets_sent >= 50);
    }
}
