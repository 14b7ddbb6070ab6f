use serde::Deserialize;
use std::time::Duration;

use crate::connection::TransportOptions;
use crate::ping::PingOptions;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_POOL_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Settings shared by clients and servers.
///
/// Durations are expressed in milliseconds so the struct deserializes from
/// plain JSON/TOML numbers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub max_frame_size: usize,
    pub send_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub keep_alive: bool,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub max_pending: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
            keep_alive: true,
            ping_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl NetConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn ping_options(&self) -> PingOptions {
        PingOptions {
            interval: Duration::from_millis(self.ping_interval_ms),
            timeout: Duration::from_millis(self.ping_timeout_ms),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            // the length prefix is a u32
            max_frame_size: self.max_frame_size.min(u32::MAX as usize),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default)]
    pub no_delay: bool,
    #[serde(default, flatten)]
    pub net: NetConfig,
}

impl ServerConfig {
    pub fn new(address: String, no_delay: bool) -> Self {
        Self { address, no_delay, net: NetConfig::default() }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.net.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.net.keep_alive = true;
        self.net.ping_interval_ms = interval.as_millis() as u64;
        self.net.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.net.keep_alive = false;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.net.max_pending = max_pending;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    pub address: String,
    #[serde(default)]
    pub no_delay: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Slots in the [`ClientEvent`](crate::ClientEvent) channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default, flatten)]
    pub net: NetConfig,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    100
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            no_delay: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            event_capacity: default_event_capacity(),
            net: NetConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(address: String, no_delay: bool) -> Self {
        Self { address, no_delay, ..Self::default() }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.net.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.net.keep_alive = true;
        self.net.ping_interval_ms = interval.as_millis() as u64;
        self.net.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.net.keep_alive = false;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.net.max_pending = max_pending;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
