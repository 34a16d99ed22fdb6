//! Network connectivity tracking
//!
//! The host platform feeds connectivity callbacks into [`NetworkMonitor::update`];
//! everything else reads the last-known snapshot. Classification is best
//! effort and degrades to `Unknown` where the platform reports nothing.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Cellular radio generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellularGeneration {
    G2,
    G3,
    G4,
    G5,
    Unknown,
}

/// Kind of link the device is using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Wifi,
    Ethernet,
    Cellular(CellularGeneration),
    Unknown,
}

impl TransportType {
    /// Socket buffer size scaled to the expected link capacity
    pub fn socket_buffer_size(&self) -> usize {
        match self {
            TransportType::Wifi | TransportType::Ethernet => 64 * 1024,
            TransportType::Cellular(CellularGeneration::G5)
            | TransportType::Cellular(CellularGeneration::G4) => 32 * 1024,
            TransportType::Cellular(CellularGeneration::G3) => 16 * 1024,
            TransportType::Cellular(_) | TransportType::Unknown => 8 * 1024,
        }
    }

    /// The slowest cellular tier, never worth a connection attempt
    pub fn is_worst_cellular(&self) -> bool {
        matches!(self, TransportType::Cellular(CellularGeneration::G2))
    }
}

/// Signal quality bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl SignalQuality {
    /// Bucket a received signal strength reading
    pub fn from_dbm(dbm: Option<i32>) -> Self {
        match dbm {
            None => SignalQuality::Unknown,
            Some(d) if d >= -70 => SignalQuality::Excellent,
            Some(d) if d >= -85 => SignalQuality::Good,
            Some(d) if d >= -100 => SignalQuality::Fair,
            Some(_) => SignalQuality::Poor,
        }
    }
}

/// Last-known network snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub transport: TransportType,
    pub signal: SignalQuality,
    pub metered: bool,
}

impl NetworkState {
    /// Nothing reported yet
    pub fn unknown() -> Self {
        Self {
            connected: false,
            transport: TransportType::Unknown,
            signal: SignalQuality::Unknown,
            metered: false,
        }
    }

    /// Wired host with no radio to classify
    pub fn wired() -> Self {
        Self {
            connected: true,
            transport: TransportType::Ethernet,
            signal: SignalQuality::Excellent,
            metered: false,
        }
    }

    /// Pre-flight gate before spending a connection attempt
    pub fn is_suitable(&self) -> bool {
        self.connected && !self.transport.is_worst_cellular() && self.signal != SignalQuality::Poor
    }
}

/// Tracks connectivity and offers a wait-for-network operation
pub struct NetworkMonitor {
    state_tx: watch::Sender<NetworkState>,
    poll_interval: Duration,
}

impl NetworkMonitor {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(initial: NetworkState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            state_tx,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Connectivity callback entry point; returns true when `connected` flipped
    pub fn update(&self, state: NetworkState) -> bool {
        let previous = self.state_tx.send_replace(state);
        let flipped = previous.connected != state.connected;
        if flipped {
            info!(
                connected = state.connected,
                transport = ?state.transport,
                signal = ?state.signal,
                "Network connectivity changed"
            );
        } else if previous != state {
            debug!(transport = ?state.transport, signal = ?state.signal, "Network state updated");
        }
        flipped
    }

    pub fn current(&self) -> NetworkState {
        *self.state_tx.borrow()
    }

    pub fn is_suitable(&self) -> bool {
        self.current().is_suitable()
    }

    /// Stream of snapshots for components that react to network changes
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state_tx.subscribe()
    }

    /// Poll until connected or `timeout` elapses; returns whether connectivity is back
    pub async fn wait_for_network(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.current().connected {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(?timeout, "Gave up waiting for network");
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::unknown())
    }
}
