use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque, stable identifier of a bonded peripheral.
///
/// The transport decides what the string means (a CoreBluetooth UUID, a
/// BlueZ object path, a MAC address). We only store and compare it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralIdentity(String);

impl PeripheralIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral as handed out by the transport: identity plus the
/// advertised name, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRef {
    pub id: PeripheralIdentity,
    pub name: Option<String>,
}

impl PeripheralRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: PeripheralIdentity::new(id),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("device")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// A connect request is already being served in these states.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting | Self::Connected)
    }
}

/// Radio state as reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PowerState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionState(ConnectionState),
    LogMessage(StatusMessage),
    /// Last complete record received from the peripheral.
    RecordReceived(String),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Health metrics the watch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HeartRate,
    StepCount,
    Temperature,
}

impl Metric {
    pub fn unit(self) -> &'static str {
        match self {
            Self::HeartRate => "count/min",
            Self::StepCount => "count",
            Self::Temperature => "degC",
        }
    }
}

/// Length of the window a health sample is attributed to.
pub const TELEMETRY_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub metric: Metric,
    pub value: f64,
    /// Unix milliseconds
    pub window_start: u64,
    /// Unix milliseconds
    pub window_end: u64,
}

impl TelemetrySample {
    /// Sample covering the window that ends at `end`.
    pub fn ending_at(metric: Metric, value: f64, end: SystemTime) -> Self {
        let start = end.checked_sub(TELEMETRY_WINDOW).unwrap_or(UNIX_EPOCH);
        Self {
            metric,
            value,
            window_start: unix_millis(start),
            window_end: unix_millis(end),
        }
    }
}

pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
