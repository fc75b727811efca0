//! Link Transport Seam
//!
//! The radio stack is consumed through [`LinkTransport`]: every call only
//! issues a request and returns immediately. Outcomes come back later as
//! [`TransportEvent`]s on the channel the transport was built with, from
//! whatever thread the stack calls back on. The link service receives them
//! on its own task and replays them into a [`TransportListener`], so all
//! state they touch has a single writer.

use crate::domain::models::{PeripheralIdentity, PeripheralRef, PowerState};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Failures while bringing up a transport. Once running, failures are
/// reported as events instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("Bluetooth stack error: {0}")]
    Stack(String),
}

/// Requests the link layer makes of the radio stack.
pub trait LinkTransport: Send {
    fn power_state(&self) -> PowerState;
    /// Filtered scan; matches arrive as [`TransportEvent::Discovered`].
    fn scan(&self, service: Uuid);
    fn stop_scan(&self);
    /// Peripherals the system already knows by identifier.
    fn retrieve_known(&self, ids: &[PeripheralIdentity]) -> Vec<PeripheralRef>;
    /// Peripherals connected at the system level that expose `service`.
    fn retrieve_connected_by(&self, service: Uuid) -> Vec<PeripheralRef>;
    fn connect(&self, peripheral: &PeripheralRef);
    fn disconnect(&self, peripheral: &PeripheralRef);
    fn discover_services(&self, peripheral: &PeripheralRef, services: &[Uuid]);
    fn discover_characteristics(&self, peripheral: &PeripheralRef, service: Uuid);
    fn write(&self, peripheral: &PeripheralRef, characteristic: Uuid, bytes: &[u8], ack: bool);
    fn subscribe(&self, peripheral: &PeripheralRef, characteristic: Uuid);
}

/// A peripheral handed back by platform state restoration.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredPeripheral {
    pub peripheral: PeripheralRef,
    /// The link survived the restart
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PowerStateChanged(PowerState),
    Discovered(PeripheralRef),
    Connected(PeripheralRef),
    FailedToConnect(PeripheralRef, String),
    Disconnected(PeripheralRef, Option<String>),
    ServicesDiscovered(PeripheralRef, Vec<Uuid>),
    CharacteristicsDiscovered {
        peripheral: PeripheralRef,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    Value {
        peripheral: PeripheralRef,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteFailed {
        peripheral: PeripheralRef,
        characteristic: Uuid,
        error: String,
    },
    RestoreState(Vec<RestoredPeripheral>),
}

/// One method per transport callback.
pub trait TransportListener {
    fn on_power_state(&mut self, state: PowerState);
    fn on_discover(&mut self, peripheral: PeripheralRef);
    fn on_connect(&mut self, peripheral: PeripheralRef);
    fn on_fail_to_connect(&mut self, peripheral: PeripheralRef, error: String);
    fn on_disconnect(&mut self, peripheral: PeripheralRef, error: Option<String>);
    fn on_services_discovered(&mut self, peripheral: PeripheralRef, services: Vec<Uuid>);
    fn on_characteristics_discovered(
        &mut self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristics: Vec<Uuid>,
    );
    fn on_value(&mut self, peripheral: PeripheralRef, characteristic: Uuid, value: Vec<u8>);
    fn on_restore_state(&mut self, restored: Vec<RestoredPeripheral>);

    fn on_write_failed(&mut self, peripheral: PeripheralRef, characteristic: Uuid, error: String) {
        warn!(
            peripheral = %peripheral.id,
            %characteristic,
            "Chunk write failed: {}",
            error
        );
    }
}

impl TransportEvent {
    /// Replay this event into `listener`.
    pub fn deliver<L: TransportListener + ?Sized>(self, listener: &mut L) {
        match self {
            Self::PowerStateChanged(state) => listener.on_power_state(state),
            Self::Discovered(p) => listener.on_discover(p),
            Self::Connected(p) => listener.on_connect(p),
            Self::FailedToConnect(p, error) => listener.on_fail_to_connect(p, error),
            Self::Disconnected(p, error) => listener.on_disconnect(p, error),
            Self::ServicesDiscovered(p, services) => listener.on_services_discovered(p, services),
            Self::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => listener.on_characteristics_discovered(peripheral, service, characteristics),
            Self::Value {
                peripheral,
                characteristic,
                value,
            } => listener.on_value(peripheral, characteristic, value),
            Self::WriteFailed {
                peripheral,
                characteristic,
                error,
            } => listener.on_write_failed(peripheral, characteristic, error),
            Self::RestoreState(restored) => listener.on_restore_state(restored),
        }
    }
}
