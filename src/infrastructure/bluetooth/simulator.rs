//! In-process stand-in for a Bangle.js watch.
//!
//! Answers every transport request immediately through the event channel, so
//! the whole link layer can run without a radio. Writes are decoded back into
//! messages the way the watch firmware would see them.

use crate::domain::models::{PeripheralIdentity, PeripheralRef, PowerState};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::protocol::{self, TERMINATOR};
use crate::infrastructure::bluetooth::transport::{EventSender, LinkTransport, TransportEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SIMULATED_ID: &str = "simulated-bangle";
pub const SIMULATED_NAME: &str = "Bangle.js (simulated)";

#[derive(Debug, Default)]
struct WatchState {
    power: PowerState,
    scanning: bool,
    connected: bool,
    subscribed: bool,
    /// Escaped chunk bodies of the message being received
    partial: String,
    received: Vec<String>,
    writes: usize,
}

#[derive(Clone)]
pub struct SimulatedWatch {
    events: EventSender,
    service: Uuid,
    write_char: Uuid,
    notify_char: Uuid,
    state: Arc<Mutex<WatchState>>,
}

impl SimulatedWatch {
    pub fn new(events: EventSender, config: &ConnectionConfig) -> Self {
        Self {
            events,
            service: config.service_uuid,
            write_char: config.write_char_uuid,
            notify_char: config.notify_char_uuid,
            state: Arc::new(Mutex::new(WatchState::default())),
        }
    }

    pub fn peripheral() -> PeripheralRef {
        PeripheralRef::new(SIMULATED_ID).with_name(SIMULATED_NAME)
    }

    pub fn set_power(&self, power: PowerState) {
        self.lock().power = power;
        if power != PowerState::PoweredOn {
            let mut state = self.lock();
            state.connected = false;
            state.subscribed = false;
            state.scanning = false;
        }
        self.emit(TransportEvent::PowerStateChanged(power));
    }

    /// Send a line from the watch. Ignored unless subscribed.
    pub fn notify(&self, line: &str) {
        if !self.lock().subscribed {
            debug!("Simulated watch not subscribed, dropping {:?}", line);
            return;
        }
        let mut value = line.as_bytes().to_vec();
        value.push(b'\n');
        self.notify_raw(value);
    }

    /// Raw notification payload, for fragmenting records by hand.
    pub fn notify_raw(&self, value: Vec<u8>) {
        self.emit(TransportEvent::Value {
            peripheral: Self::peripheral(),
            characteristic: self.notify_char,
            value,
        });
    }

    /// Lose the link as if the watch walked out of range.
    pub fn drop_link(&self) {
        {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.subscribed = false;
            state.partial.clear();
        }
        self.emit(TransportEvent::Disconnected(
            Self::peripheral(),
            Some("simulated link loss".to_string()),
        ));
    }

    /// Messages the watch has fully received.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Nobody is listening to the simulated watch");
        }
    }

    fn accept_chunk(&self, bytes: &[u8]) {
        let Some(body) = protocol::unwrap_chunk(bytes) else {
            warn!("Simulated watch got a write it cannot parse");
            return;
        };
        let mut state = self.lock();
        state.writes += 1;
        state.partial.push_str(body);

        let Some(text) = protocol::unescape(&state.partial) else {
            // Chunks never split an escape, so this is a real error
            warn!("Simulated watch got a malformed escape");
            state.partial.clear();
            return;
        };
        if let Some(message) = text.strip_suffix(TERMINATOR) {
            info!("Watch received: {}", message);
            state.received.push(message.to_string());
            state.partial.clear();
        }
    }
}

impl LinkTransport for SimulatedWatch {
    fn power_state(&self) -> PowerState {
        self.lock().power
    }

    fn scan(&self, service: Uuid) {
        self.lock().scanning = true;
        if service == self.service {
            self.emit(TransportEvent::Discovered(Self::peripheral()));
        }
    }

    fn stop_scan(&self) {
        self.lock().scanning = false;
    }

    fn retrieve_known(&self, ids: &[PeripheralIdentity]) -> Vec<PeripheralRef> {
        let ours = Self::peripheral();
        if ids.contains(&ours.id) {
            vec![ours]
        } else {
            Vec::new()
        }
    }

    fn retrieve_connected_by(&self, service: Uuid) -> Vec<PeripheralRef> {
        if service == self.service && self.lock().connected {
            vec![Self::peripheral()]
        } else {
            Vec::new()
        }
    }

    fn connect(&self, peripheral: &PeripheralRef) {
        if peripheral.id.as_str() != SIMULATED_ID {
            self.emit(TransportEvent::FailedToConnect(
                peripheral.clone(),
                "unknown peripheral".to_string(),
            ));
            return;
        }
        self.lock().connected = true;
        self.emit(TransportEvent::Connected(Self::peripheral()));
    }

    fn disconnect(&self, peripheral: &PeripheralRef) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.subscribed = false;
            state.partial.clear();
        }
        self.emit(TransportEvent::Disconnected(peripheral.clone(), None));
    }

    fn discover_services(&self, peripheral: &PeripheralRef, _services: &[Uuid]) {
        self.emit(TransportEvent::ServicesDiscovered(
            peripheral.clone(),
            vec![self.service],
        ));
    }

    fn discover_characteristics(&self, peripheral: &PeripheralRef, service: Uuid) {
        self.emit(TransportEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service,
            characteristics: vec![self.write_char, self.notify_char],
        });
    }

    fn write(&self, peripheral: &PeripheralRef, characteristic: Uuid, bytes: &[u8], _ack: bool) {
        if !self.lock().connected || characteristic != self.write_char {
            self.emit(TransportEvent::WriteFailed {
                peripheral: peripheral.clone(),
                characteristic,
                error: "not connected".to_string(),
            });
            return;
        }
        self.accept_chunk(bytes);
    }

    fn subscribe(&self, _peripheral: &PeripheralRef, characteristic: Uuid) {
        if characteristic == self.notify_char {
            self.lock().subscribed = true;
        }
    }
}
