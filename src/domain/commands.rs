//! Inbound record classification and routing.
//!
//! A record is either a JSON packet carrying a `type` discriminator or a bare
//! command token. Anything unrecognised is dropped so newer watch firmware
//! can't break an older phone.

use crate::domain::models::{Metric, TelemetrySample};
use serde_json::{Map, Value};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Sent once the link is ready and in answer to a connectivity probe.
pub const CONNECTED_ANNOUNCEMENT: &str = "iPhone Connected";

/// Discriminator value of health telemetry packets.
pub const HEALTH_PACKET_TYPE: &str = "health";

/// Known command tokens. Matching is exact and case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    FindPhone,
    StopFindPhone,
    ConnectivityProbe,
}

impl Command {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "FindPhone" => Some(Self::FindPhone),
            "StopFindPhone" => Some(Self::StopFindPhone),
            "Pinging Connection..." => Some(Self::ConnectivityProbe),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::FindPhone => "FindPhone",
            Self::StopFindPhone => "StopFindPhone",
            Self::ConnectivityProbe => "Pinging Connection...",
        }
    }
}

/// Values carried by a `{"type":"health", ...}` packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReading {
    pub heart_rate: Option<f64>,
    pub steps: Option<f64>,
    pub temperature: Option<f64>,
}

impl HealthReading {
    fn from_fields(fields: &Map<String, Value>) -> Self {
        // Non-numeric values are skipped field by field
        let number = |key: &str| fields.get(key).and_then(Value::as_f64);
        Self {
            heart_rate: number("hr"),
            steps: number("steps"),
            temperature: number("temp"),
        }
    }

    /// One sample per metric present, each for the window ending at `now`.
    pub fn samples(&self, now: SystemTime) -> Vec<TelemetrySample> {
        [
            (Metric::HeartRate, self.heart_rate),
            (Metric::StepCount, self.steps),
            (Metric::Temperature, self.temperature),
        ]
        .into_iter()
        .filter_map(|(metric, value)| value.map(|v| TelemetrySample::ending_at(metric, v, now)))
        .collect()
    }
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRecord {
    Health(HealthReading),
    Token(String),
}

impl CommandRecord {
    pub fn classify(record: &str) -> Self {
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(record) {
            match fields.get("type").and_then(Value::as_str) {
                Some(HEALTH_PACKET_TYPE) => {
                    return Self::Health(HealthReading::from_fields(&fields));
                }
                Some(other) => debug!("Packet type {:?} not handled, trying as token", other),
                None => {}
            }
        }
        Self::Token(record.to_string())
    }
}

/// Receives health samples decoded from the watch.
pub trait TelemetryRecorder: Send + Sync {
    fn record(&self, sample: TelemetrySample) -> anyhow::Result<()>;
}

/// Find-my-phone alert. Both calls must be idempotent.
pub trait AlarmController: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Fire-and-forget path back to the watch.
pub trait OutboundSink: Send + Sync {
    fn send(&self, message: &str);
}

/// Routes records to the collaborators. Holds no state of its own.
pub struct CommandDispatcher {
    telemetry: Box<dyn TelemetryRecorder>,
    alarm: Box<dyn AlarmController>,
    outbound: Box<dyn OutboundSink>,
}

impl CommandDispatcher {
    pub fn new(
        telemetry: Box<dyn TelemetryRecorder>,
        alarm: Box<dyn AlarmController>,
        outbound: Box<dyn OutboundSink>,
    ) -> Self {
        Self {
            telemetry,
            alarm,
            outbound,
        }
    }

    pub fn dispatch(&self, record: &str) {
        match CommandRecord::classify(record) {
            CommandRecord::Health(reading) => self.handle_health(&reading, SystemTime::now()),
            CommandRecord::Token(token) => self.handle_token(&token),
        }
    }

    fn handle_health(&self, reading: &HealthReading, now: SystemTime) {
        for sample in reading.samples(now) {
            let metric = sample.metric;
            match self.telemetry.record(sample) {
                Ok(()) => debug!("Recorded {:?} sample", metric),
                Err(e) => warn!("Failed to record {:?}: {}", metric, e),
            }
        }
    }

    fn handle_token(&self, token: &str) {
        let Some(command) = Command::from_token(token) else {
            debug!("Ignoring unknown command token {:?}", token);
            return;
        };

        info!("Received command: {:?}", command);
        match command {
            Command::FindPhone => self.alarm.start(),
            Command::StopFindPhone => self.alarm.stop(),
            Command::ConnectivityProbe => self.outbound.send(CONNECTED_ANNOUNCEMENT),
        }
    }
}
