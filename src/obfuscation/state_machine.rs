// Protocol state machine
//
// Per-connection Markov walk over the phases of a real protocol. The current
// state decides size range, base interval and timing pattern of the next
// packet, so long-running sessions show handshakes, steady data, teardown and
// reconnect churn the way real flows do.

use super::sampling::{lognormal, triangular, uniform, uniform_usize, weighted_choice};
use crate::profile::TrafficProfile;
use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

const STATE_HISTORY: usize = 100;
const GIB: u64 = 1024 * 1024 * 1024;
const RENEGOTIATE_AFTER: Duration = Duration::from_secs(300);
const ICE_RESTART_AFTER: Duration = Duration::from_secs(600);
/// Default smoothed RTT used to floor bidirectional intervals
const RTT_ESTIMATE: f64 = 0.02;

/// Protocol families the state machine can imitate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Tls,
    Quic,
    Webrtc,
    Ssh,
    Http2,
    Http3,
    Generic,
}

impl ProtocolType {
    pub const ALL: [ProtocolType; 7] = [
        ProtocolType::Tls,
        ProtocolType::Quic,
        ProtocolType::Webrtc,
        ProtocolType::Ssh,
        ProtocolType::Http2,
        ProtocolType::Http3,
        ProtocolType::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolType::Tls => "tls",
            ProtocolType::Quic => "quic",
            ProtocolType::Webrtc => "webrtc",
            ProtocolType::Ssh => "ssh",
            ProtocolType::Http2 => "http2",
            ProtocolType::Http3 => "http3",
            ProtocolType::Generic => "generic",
        }
    }

    /// Protocol that carries a given traffic profile; mixed picks any
    pub fn for_profile<R: Rng + ?Sized>(profile: TrafficProfile, rng: &mut R) -> Self {
        match profile {
            TrafficProfile::Web => ProtocolType::Http2,
            TrafficProfile::Video => ProtocolType::Quic,
            TrafficProfile::Voip => ProtocolType::Webrtc,
            TrafficProfile::File => ProtocolType::Tls,
            TrafficProfile::Gaming => ProtocolType::Generic,
            TrafficProfile::Mixed => Self::ALL[rng.gen_range(0..Self::ALL.len())],
        }
    }

    /// Maximum connection lifetime before termination becomes likely
    pub fn max_lifetime(self) -> Duration {
        let secs = match self {
            ProtocolType::Tls | ProtocolType::Generic => 3600,
            ProtocolType::Quic => 7200,
            ProtocolType::Webrtc => 10800,
            ProtocolType::Ssh => 14400,
            ProtocolType::Http2 | ProtocolType::Http3 => 1800,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| anyhow!("Unknown protocol type: {}", s))
    }
}

/// Union of the connection states used by every protocol table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Init,
    Handshake,
    Data,
    Closing,
    Closed,
    Initial,
    Retry,
    Application,
    Stun,
    Turn,
    Dtls,
    Srtp,
    Rtcp,
    Auth,
    Session,
    Channel,
    Connection,
    Settings,
    Stream,
    Push,
    QuicHandshake,
    Connecting,
    Active,
    Burst,
    Idle,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        use ConnState::*;
        match self {
            Init => "init",
            Handshake => "handshake",
            Data => "data",
            Closing => "closing",
            Closed => "closed",
            Initial => "initial",
            Retry => "retry",
            Application => "application",
            Stun => "stun",
            Turn => "turn",
            Dtls => "dtls",
            Srtp => "srtp",
            Rtcp => "rtcp",
            Auth => "auth",
            Session => "session",
            Channel => "channel",
            Connection => "connection",
            Settings => "settings",
            Stream => "stream",
            Push => "push",
            QuicHandshake => "quic_handshake",
            Connecting => "connecting",
            Active => "active",
            Burst => "burst",
            Idle => "idle",
        }
    }

    /// States in which payload bytes are considered transferred
    fn carries_data(self) -> bool {
        matches!(
            self,
            ConnState::Data | ConnState::Application | ConnState::Session | ConnState::Srtp | ConnState::Stream
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse lifecycle phase derived from the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Startup,
    Active,
    Closing,
    Closed,
    Unknown,
}

/// Intra-state timing shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingPattern {
    /// Alternates a short and a long gap
    RequestResponse,
    Stream,
    RtpStream,
    Periodic,
    /// Log-normal human think time
    Interactive,
    Jitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateCharacteristics {
    pub size_range: (usize, usize),
    pub interval: f64,
    pub burst: bool,
    pub bidirectional: bool,
    pub pattern: TimingPattern,
}

const fn chars(min: usize, max: usize, interval: f64, burst: bool, bidirectional: bool, pattern: TimingPattern) -> StateCharacteristics {
    StateCharacteristics {
        size_range: (min, max),
        interval,
        burst,
        bidirectional,
        pattern,
    }
}

const DEFAULT_CHARACTERISTICS: StateCharacteristics = chars(64, 1400, 0.1, false, true, TimingPattern::Jitter);

type Edges = &'static [(ConnState, f64)];
type TransitionTable = &'static [(ConnState, Edges)];
type CharacteristicTable = &'static [(ConnState, StateCharacteristics)];

mod tables {
    use super::ConnState::*;
    use super::TimingPattern as P;
    use super::{chars, CharacteristicTable, TransitionTable};

    pub const TLS: TransitionTable = &[
        (Init, &[(Handshake, 0.95), (Closed, 0.05)]),
        (Handshake, &[(Handshake, 0.2), (Data, 0.75), (Closing, 0.03), (Closed, 0.02)]),
        (Data, &[(Data, 0.94), (Closing, 0.05), (Closed, 0.01)]),
        (Closing, &[(Closed, 0.9), (Data, 0.1)]),
        (Closed, &[(Init, 0.8), (Closed, 0.2)]),
    ];

    pub const QUIC: TransitionTable = &[
        (Init, &[(Initial, 0.95), (Closed, 0.05)]),
        (Initial, &[(Handshake, 0.9), (Retry, 0.05), (Closed, 0.05)]),
        (Retry, &[(Initial, 0.8), (Closed, 0.2)]),
        (Handshake, &[(Handshake, 0.3), (Application, 0.65), (Closing, 0.03), (Closed, 0.02)]),
        (Application, &[(Application, 0.96), (Closing, 0.03), (Closed, 0.01)]),
        (Closing, &[(Closed, 0.95), (Application, 0.05)]),
        (Closed, &[(Init, 0.7), (Closed, 0.3)]),
    ];

    pub const WEBRTC: TransitionTable = &[
        (Init, &[(Stun, 0.95), (Closed, 0.05)]),
        (Stun, &[(Stun, 0.3), (Turn, 0.2), (Dtls, 0.45), (Closed, 0.05)]),
        (Turn, &[(Turn, 0.2), (Dtls, 0.75), (Closed, 0.05)]),
        (Dtls, &[(Dtls, 0.2), (Srtp, 0.75), (Closed, 0.05)]),
        (Srtp, &[(Srtp, 0.90), (Rtcp, 0.08), (Closing, 0.01), (Closed, 0.01)]),
        (Rtcp, &[(Srtp, 0.95), (Rtcp, 0.03), (Closing, 0.01), (Closed, 0.01)]),
        (Closing, &[(Closed, 0.9), (Srtp, 0.1)]),
        (Closed, &[(Init, 0.6), (Closed, 0.4)]),
    ];

    pub const SSH: TransitionTable = &[
        (Init, &[(Handshake, 0.95), (Closed, 0.05)]),
        (Handshake, &[(Auth, 0.9), (Closed, 0.1)]),
        (Auth, &[(Auth, 0.2), (Session, 0.75), (Closed, 0.05)]),
        (Session, &[(Session, 0.93), (Channel, 0.05), (Closing, 0.01), (Closed, 0.01)]),
        (Channel, &[(Session, 0.8), (Channel, 0.15), (Closing, 0.04), (Closed, 0.01)]),
        (Closing, &[(Closed, 0.95), (Session, 0.05)]),
        (Closed, &[(Init, 0.5), (Closed, 0.5)]),
    ];

    pub const HTTP2: TransitionTable = &[
        (Init, &[(Connection, 0.95), (Closed, 0.05)]),
        (Connection, &[(Settings, 0.9), (Closed, 0.1)]),
        (Settings, &[(Stream, 0.85), (Settings, 0.1), (Closed, 0.05)]),
        (Stream, &[(Stream, 0.7), (Data, 0.25), (Push, 0.03), (Closing, 0.01), (Closed, 0.01)]),
        (Data, &[(Data, 0.8), (Stream, 0.15), (Closing, 0.04), (Closed, 0.01)]),
        (Push, &[(Data, 0.7), (Stream, 0.25), (Closing, 0.04), (Closed, 0.01)]),
        (Closing, &[(Closed, 0.9), (Stream, 0.1)]),
        (Closed, &[(Init, 0.6), (Closed, 0.4)]),
    ];

    pub const HTTP3: TransitionTable = &[
        (Init, &[(QuicHandshake, 0.95), (Closed, 0.05)]),
        (QuicHandshake, &[(Settings, 0.85), (QuicHandshake, 0.1), (Closed, 0.05)]),
        (Settings, &[(Stream, 0.8), (Settings, 0.15), (Closed, 0.05)]),
        (Stream, &[(Stream, 0.6), (Data, 0.35), (Closing, 0.04), (Closed, 0.01)]),
        (Data, &[(Data, 0.75), (Stream, 0.2), (Closing, 0.04), (Closed, 0.01)]),
        (Closing, &[(Closed, 0.95), (Stream, 0.05)]),
        (Closed, &[(Init, 0.7), (Closed, 0.3)]),
    ];

    pub const GENERIC: TransitionTable = &[
        (Init, &[(Connecting, 0.9), (Idle, 0.05), (Closed, 0.05)]),
        (Connecting, &[(Active, 0.85), (Idle, 0.1), (Closed, 0.05)]),
        (Active, &[(Active, 0.75), (Burst, 0.15), (Idle, 0.08), (Closing, 0.01), (Closed, 0.01)]),
        (Burst, &[(Active, 0.7), (Burst, 0.2), (Idle, 0.08), (Closing, 0.01), (Closed, 0.01)]),
        (Idle, &[(Active, 0.6), (Idle, 0.35), (Closing, 0.03), (Closed, 0.02)]),
        (Closing, &[(Closed, 0.9), (Active, 0.1)]),
        (Closed, &[(Init, 0.5), (Closed, 0.5)]),
    ];

    pub const TLS_CHARS: CharacteristicTable = &[
        (Init, chars(0, 0, 0.0, false, false, P::Jitter)),
        (Handshake, chars(100, 2000, 0.005, true, true, P::RequestResponse)),
        (Data, chars(64, 16384, 0.02, false, true, P::Stream)),
        // alert record
        (Closing, chars(21, 31, 0.001, false, true, P::Jitter)),
        (Closed, chars(0, 0, 1.0, false, false, P::Jitter)),
    ];

    pub const QUIC_CHARS: CharacteristicTable = &[
        (Initial, chars(1200, 1400, 0.001, true, true, P::Jitter)),
        (Handshake, chars(500, 1400, 0.003, true, true, P::RequestResponse)),
        (Application, chars(100, 1400, 0.015, false, true, P::Stream)),
        (Retry, chars(100, 200, 0.1, false, false, P::Jitter)),
    ];

    pub const WEBRTC_CHARS: CharacteristicTable = &[
        (Stun, chars(20, 200, 0.1, false, true, P::RequestResponse)),
        (Turn, chars(50, 300, 0.05, false, true, P::RequestResponse)),
        (Dtls, chars(100, 1000, 0.01, true, true, P::Jitter)),
        (Srtp, chars(100, 200, 0.02, false, true, P::RtpStream)),
        (Rtcp, chars(70, 90, 1.0, false, true, P::Periodic)),
    ];

    pub const SSH_CHARS: CharacteristicTable = &[
        (Handshake, chars(50, 500, 0.01, true, true, P::Jitter)),
        (Auth, chars(100, 1000, 0.02, false, true, P::Jitter)),
        (Session, chars(32, 1400, 0.05, false, true, P::Interactive)),
        (Channel, chars(100, 1400, 0.02, true, true, P::Jitter)),
    ];

    pub const GENERIC_CHARS: CharacteristicTable = &[
        (Connecting, chars(64, 500, 0.01, true, true, P::Jitter)),
        (Active, chars(200, 1200, 0.02, false, true, P::Jitter)),
        (Burst, chars(1000, 1400, 0.001, true, false, P::Jitter)),
        (Idle, chars(64, 128, 1.0, false, false, P::Jitter)),
    ];
}

fn transition_table(protocol: ProtocolType) -> TransitionTable {
    match protocol {
        ProtocolType::Tls => tables::TLS,
        ProtocolType::Quic => tables::QUIC,
        ProtocolType::Webrtc => tables::WEBRTC,
        ProtocolType::Ssh => tables::SSH,
        ProtocolType::Http2 => tables::HTTP2,
        ProtocolType::Http3 => tables::HTTP3,
        ProtocolType::Generic => tables::GENERIC,
    }
}

fn characteristic_table(protocol: ProtocolType) -> CharacteristicTable {
    match protocol {
        ProtocolType::Tls => tables::TLS_CHARS,
        ProtocolType::Quic => tables::QUIC_CHARS,
        ProtocolType::Webrtc => tables::WEBRTC_CHARS,
        ProtocolType::Ssh => tables::SSH_CHARS,
        // HTTP framing shares the generic per-state shapes
        ProtocolType::Http2 | ProtocolType::Http3 | ProtocolType::Generic => tables::GENERIC_CHARS,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateMachineStatistics {
    pub protocol: ProtocolType,
    pub current_state: ConnState,
    pub session_id: u32,
    pub handshake_complete: bool,
    pub data_transferred: u64,
    pub data_transferred_mb: f64,
    pub connection_age_secs: f64,
    pub time_in_state_secs: f64,
    pub session_phase: SessionPhase,
    pub state_counts: BTreeMap<ConnState, u64>,
    pub total_state_changes: u64,
    pub recent_states: Vec<ConnState>,
}

/// Markov walk over one protocol's connection states
pub struct ProtocolStateMachine {
    protocol: ProtocolType,
    current: ConnState,
    transitions: TransitionTable,
    characteristics: CharacteristicTable,
    history: VecDeque<ConnState>,
    state_counts: BTreeMap<ConnState, u64>,
    handshake_complete: bool,
    data_transferred: u64,
    connection_start: Instant,
    last_state_change: Instant,
    session_id: u32,
    rng: StdRng,
}

impl ProtocolStateMachine {
    pub fn new(protocol: ProtocolType) -> Self {
        Self::with_rng(protocol, StdRng::from_entropy())
    }

    pub fn with_rng(protocol: ProtocolType, mut rng: StdRng) -> Self {
        let now = Instant::now();
        Self {
            protocol,
            current: ConnState::Init,
            transitions: transition_table(protocol),
            characteristics: characteristic_table(protocol),
            history: VecDeque::with_capacity(STATE_HISTORY),
            state_counts: BTreeMap::new(),
            handshake_complete: false,
            data_transferred: 0,
            connection_start: now,
            last_state_change: now,
            session_id: rng.gen(),
            rng,
        }
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn current_state(&self) -> ConnState {
        self.current
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn data_transferred(&self) -> u64 {
        self.data_transferred
    }

    /// Outgoing edges of `state` in this machine's table
    pub fn edges(&self, state: ConnState) -> Option<&'static [(ConnState, f64)]> {
        self.transitions.iter().find(|(s, _)| *s == state).map(|(_, e)| *e)
    }

    pub fn characteristics(&self) -> StateCharacteristics {
        self.characteristics
            .iter()
            .find(|(s, _)| *s == self.current)
            .map(|(_, c)| *c)
            .unwrap_or(DEFAULT_CHARACTERISTICS)
    }

    /// Transition using the real connection age
    pub fn next_state(&mut self) -> ConnState {
        let age = self.connection_start.elapsed();
        self.next_state_with_age(age)
    }

    /// Transition as if the connection were `age` old
    pub fn next_state_with_age(&mut self, age: Duration) -> ConnState {
        self.last_state_change = Instant::now();

        let edges = match self.edges(self.current) {
            Some(edges) => edges,
            None => {
                self.current = ConnState::Init;
                self.edges(ConnState::Init).unwrap_or(&[])
            }
        };
        let edges = self.apply_protocol_logic(edges.to_vec(), age);

        if let Some(next) = weighted_choice(&mut self.rng, &edges).copied() {
            self.current = next;
        }

        if self.history.len() == STATE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(self.current);
        *self.state_counts.entry(self.current).or_insert(0) += 1;
        self.update_protocol_state();
        self.current
    }

    /// Long-lived session effects: renegotiation, migration, ICE restart, rekey
    fn apply_protocol_logic(&mut self, mut edges: Vec<(ConnState, f64)>, age: Duration) -> Vec<(ConnState, f64)> {
        let bump = match (self.protocol, self.current) {
            (ProtocolType::Tls, ConnState::Data) if age > RENEGOTIATE_AFTER => Some((ConnState::Handshake, 0.1)),
            (ProtocolType::Quic, ConnState::Application) if self.rng.gen_bool(0.001) => {
                Some((ConnState::Handshake, 0.05))
            }
            (ProtocolType::Webrtc, ConnState::Srtp) if age > ICE_RESTART_AFTER => Some((ConnState::Stun, 0.02)),
            (ProtocolType::Ssh, ConnState::Session) if self.data_transferred > GIB => {
                Some((ConnState::Handshake, 0.1))
            }
            _ => None,
        };

        if let Some((target, weight)) = bump {
            match edges.iter_mut().find(|(s, _)| *s == target) {
                Some(edge) => edge.1 = weight,
                None => edges.push((target, weight)),
            }
        }
        edges
    }

    fn update_protocol_state(&mut self) {
        match self.current {
            ConnState::Handshake | ConnState::Auth | ConnState::Dtls => self.handshake_complete = false,
            ConnState::Data | ConnState::Application | ConnState::Session | ConnState::Srtp => {
                self.handshake_complete = true
            }
            _ => {}
        }

        if self.current.carries_data() {
            let (min, max) = self.characteristics().size_range;
            self.data_transferred += ((min + max) / 2) as u64;
        }
    }

    /// One `(size, interval)` sample for the current state
    pub fn generate_packet_params(&mut self) -> (usize, f64) {
        let c = self.characteristics();
        let (min, max) = c.size_range;

        let size = if c.burst {
            // lean toward the top of the range
            triangular(&mut self.rng, min as f64, max as f64, max as f64) as usize
        } else {
            uniform_usize(&mut self.rng, min, max)
        };

        let base = c.interval;
        let mut interval = match c.pattern {
            TimingPattern::RequestResponse => {
                let visits = self.state_counts.get(&self.current).copied().unwrap_or(0);
                if visits % 2 == 0 {
                    base * 0.1
                } else {
                    base * 2.0
                }
            }
            TimingPattern::Stream => base * uniform(&mut self.rng, 0.8, 1.2),
            TimingPattern::RtpStream => base * uniform(&mut self.rng, 0.98, 1.02),
            TimingPattern::Periodic => base,
            TimingPattern::Interactive => (base * lognormal(&mut self.rng, 0.0, 0.5)).clamp(0.001, 5.0),
            TimingPattern::Jitter => base * uniform(&mut self.rng, 0.5, 1.5),
        };

        if c.bidirectional {
            interval = interval.max(RTT_ESTIMATE * 0.5);
        }
        (size, interval)
    }

    pub fn should_terminate(&mut self) -> bool {
        let age = self.connection_start.elapsed();
        self.should_terminate_with_age(age)
    }

    pub fn should_terminate_with_age(&mut self, age: Duration) -> bool {
        if self.current == ConnState::Closed {
            return self.rng.gen_bool(0.5);
        }
        if age > self.protocol.max_lifetime() {
            return self.rng.gen_bool(0.1);
        }
        if self.data_transferred > 10 * GIB {
            return self.rng.gen_bool(0.05);
        }
        false
    }

    /// Drop decision for a packet sent in the current state
    pub fn simulate_packet_loss(&mut self, loss_rate: f64) -> bool {
        let adjusted = match self.current {
            ConnState::Handshake | ConnState::Auth | ConnState::Initial => loss_rate * 0.5,
            ConnState::Closing | ConnState::Closed => loss_rate * 2.0,
            _ => loss_rate,
        };
        self.rng.gen_bool(adjusted.clamp(0.0, 1.0))
    }

    pub fn session_phase(&self) -> SessionPhase {
        use ConnState::*;
        match self.current {
            Init | Handshake | Auth | Stun | Turn | Dtls | Initial | Connection | Settings | QuicHandshake => {
                SessionPhase::Startup
            }
            Data | Application | Session | Srtp | Stream | Active | Burst | Channel => SessionPhase::Active,
            Closing => SessionPhase::Closing,
            Closed => SessionPhase::Closed,
            Retry | Rtcp | Push | Connecting | Idle => SessionPhase::Unknown,
        }
    }

    pub fn statistics(&self) -> StateMachineStatistics {
        let skip = self.history.len().saturating_sub(10);
        StateMachineStatistics {
            protocol: self.protocol,
            current_state: self.current,
            session_id: self.session_id,
            handshake_complete: self.handshake_complete,
            data_transferred: self.data_transferred,
            data_transferred_mb: self.data_transferred as f64 / (1024.0 * 1024.0),
            connection_age_secs: self.connection_start.elapsed().as_secs_f64(),
            time_in_state_secs: self.last_state_change.elapsed().as_secs_f64(),
            session_phase: self.session_phase(),
            state_counts: self.state_counts.clone(),
            total_state_changes: self.state_counts.values().sum(),
            recent_states: self.history.iter().skip(skip).copied().collect(),
        }
    }

    /// Back to `init` with a fresh session id
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.current = ConnState::Init;
        self.history.clear();
        self.state_counts.clear();
        self.handshake_complete = false;
        self.data_transferred = 0;
        self.connection_start = now;
        self.last_state_change = now;
        self.session_id = self.rng.gen();
        debug!(protocol = %self.protocol, session_id = self.session_id, "Protocol session reset");
    }
}
