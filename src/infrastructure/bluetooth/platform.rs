//! Host radio backed by `btleplug`.
//!
//! btleplug is async while [`LinkTransport`] only issues requests, so every
//! request that needs the stack is spawned and reports back through the event
//! channel. Lookups answer from a cache kept current by the adapter's event
//! stream. Chunk writes go through one writer task to keep their order.

use crate::domain::models::{PeripheralIdentity, PeripheralRef, PowerState};
use crate::infrastructure::bluetooth::transport::{
    EventSender, LinkTransport, TransportError, TransportEvent,
};
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct KnownPeripheral {
    peripheral: Peripheral,
    name: Option<String>,
    services: Vec<Uuid>,
    connected: bool,
}

impl KnownPeripheral {
    fn reference(&self) -> PeripheralRef {
        let r = PeripheralRef::new(self.peripheral.id().to_string());
        match &self.name {
            Some(name) => r.with_name(name.clone()),
            None => r,
        }
    }
}

#[derive(Default)]
struct Shared {
    power: PowerState,
    /// Service filter of the running scan
    scanning: Option<Uuid>,
    known: HashMap<String, KnownPeripheral>,
    notification_pump: Option<JoinHandle<()>>,
}

struct WriteRequest {
    reference: PeripheralRef,
    peripheral: Peripheral,
    characteristic: Uuid,
    bytes: Vec<u8>,
    ack: bool,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: EventSender,
    shared: Arc<Mutex<Shared>>,
    writes: mpsc::UnboundedSender<WriteRequest>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stack_error(e: btleplug::Error) -> TransportError {
    TransportError::Stack(e.to_string())
}

fn map_power(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::PoweredOn,
        CentralState::PoweredOff => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

async fn describe(peripheral: Peripheral) -> KnownPeripheral {
    let properties = peripheral.properties().await.ok().flatten();
    let connected = peripheral.is_connected().await.unwrap_or(false);
    KnownPeripheral {
        name: properties.as_ref().and_then(|p| p.local_name.clone()),
        services: properties.map(|p| p.services).unwrap_or_default(),
        connected,
        peripheral,
    }
}

impl BtleplugTransport {
    /// Open the first adapter and start following its events.
    pub async fn start(events: EventSender) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(stack_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(stack_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        info!(
            "Using adapter: {}",
            adapter.adapter_info().await.map_err(stack_error)?
        );

        let shared = Arc::new(Mutex::new(Shared::default()));
        let power = map_power(adapter.adapter_state().await.map_err(stack_error)?);
        for peripheral in adapter.peripherals().await.map_err(stack_error)? {
            let known = describe(peripheral).await;
            lock(&shared).known.insert(known.reference().id.to_string(), known);
        }
        lock(&shared).power = power;

        let central_events = adapter.events().await.map_err(stack_error)?;
        tokio::spawn(Self::follow_adapter(
            adapter.clone(),
            central_events,
            shared.clone(),
            events.clone(),
        ));

        let (writes, write_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_writer(write_rx, events.clone()));

        let _ = events.send(TransportEvent::PowerStateChanged(power));
        Ok(Self {
            adapter,
            events,
            shared,
            writes,
        })
    }

    async fn follow_adapter(
        adapter: Adapter,
        mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        shared: Arc<Mutex<Shared>>,
        events: EventSender,
    ) {
        while let Some(event) = central_events.next().await {
            match event {
                CentralEvent::StateUpdate(state) => {
                    let power = map_power(state);
                    lock(&shared).power = power;
                    let _ = events.send(TransportEvent::PowerStateChanged(power));
                }
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    let known = describe(peripheral).await;
                    let reference = known.reference();
                    let matches = {
                        let mut guard = lock(&shared);
                        let matches = guard
                            .scanning
                            .is_some_and(|service| known.services.contains(&service));
                        guard.known.insert(reference.id.to_string(), known);
                        matches
                    };
                    if matches {
                        let _ = events.send(TransportEvent::Discovered(reference));
                    }
                }
                CentralEvent::DeviceConnected(id) => {
                    if let Some(known) = lock(&shared).known.get_mut(&id.to_string()) {
                        known.connected = true;
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let reference = {
                        let mut guard = lock(&shared);
                        guard.known.get_mut(&id.to_string()).map(|known| {
                            known.connected = false;
                            known.reference()
                        })
                    };
                    if let Some(reference) = reference {
                        let _ = events.send(TransportEvent::Disconnected(reference, None));
                    }
                }
                _ => {}
            }
        }
        warn!("Adapter event stream ended");
    }

    async fn run_writer(mut requests: mpsc::UnboundedReceiver<WriteRequest>, events: EventSender) {
        while let Some(request) = requests.recv().await {
            let characteristic = request
                .peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == request.characteristic);
            let result = match characteristic {
                Some(c) => {
                    let write_type = if request.ack {
                        WriteType::WithResponse
                    } else {
                        WriteType::WithoutResponse
                    };
                    request
                        .peripheral
                        .write(&c, &request.bytes, write_type)
                        .await
                        .map_err(|e| e.to_string())
                }
                None => Err("characteristic not discovered".to_string()),
            };
            if let Err(error) = result {
                let _ = events.send(TransportEvent::WriteFailed {
                    peripheral: request.reference,
                    characteristic: request.characteristic,
                    error,
                });
            }
        }
    }

    fn peripheral(&self, reference: &PeripheralRef) -> Option<Peripheral> {
        lock(&self.shared)
            .known
            .get(reference.id.as_str())
            .map(|k| k.peripheral.clone())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

impl LinkTransport for BtleplugTransport {
    fn power_state(&self) -> PowerState {
        lock(&self.shared).power
    }

    fn scan(&self, service: Uuid) {
        lock(&self.shared).scanning = Some(service);
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let filter = ScanFilter {
                services: vec![service],
            };
            if let Err(e) = adapter.start_scan(filter).await {
                warn!("Failed to start scan: {}", e);
            }
        });
    }

    fn stop_scan(&self) {
        lock(&self.shared).scanning = None;
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        });
    }

    fn retrieve_known(&self, ids: &[PeripheralIdentity]) -> Vec<PeripheralRef> {
        let guard = lock(&self.shared);
        ids.iter()
            .filter_map(|id| guard.known.get(id.as_str()))
            .map(KnownPeripheral::reference)
            .collect()
    }

    fn retrieve_connected_by(&self, service: Uuid) -> Vec<PeripheralRef> {
        lock(&self.shared)
            .known
            .values()
            .filter(|k| k.connected && k.services.contains(&service))
            .map(KnownPeripheral::reference)
            .collect()
    }

    fn connect(&self, reference: &PeripheralRef) {
        let Some(peripheral) = self.peripheral(reference) else {
            self.emit(TransportEvent::FailedToConnect(
                reference.clone(),
                "peripheral not known to the adapter".to_string(),
            ));
            return;
        };
        let reference = reference.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected(reference),
                Err(e) => TransportEvent::FailedToConnect(reference, e.to_string()),
            };
            let _ = events.send(event);
        });
    }

    fn disconnect(&self, reference: &PeripheralRef) {
        if let Some(pump) = lock(&self.shared).notification_pump.take() {
            pump.abort();
        }
        let Some(peripheral) = self.peripheral(reference) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect: {}", e);
            }
        });
    }

    fn discover_services(&self, reference: &PeripheralRef, _services: &[Uuid]) {
        let Some(peripheral) = self.peripheral(reference) else {
            return;
        };
        let reference = reference.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!("Service discovery failed: {}", e);
                let _ = events.send(TransportEvent::Disconnected(reference, Some(e.to_string())));
                return;
            }
            let services = peripheral.services().into_iter().map(|s| s.uuid).collect();
            let _ = events.send(TransportEvent::ServicesDiscovered(reference, services));
        });
    }

    fn discover_characteristics(&self, reference: &PeripheralRef, service: Uuid) {
        let Some(peripheral) = self.peripheral(reference) else {
            return;
        };
        // Characteristics come with service discovery in btleplug
        let characteristics = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter().map(|c| c.uuid))
            .collect();
        self.emit(TransportEvent::CharacteristicsDiscovered {
            peripheral: reference.clone(),
            service,
            characteristics,
        });
    }

    fn write(&self, reference: &PeripheralRef, characteristic: Uuid, bytes: &[u8], ack: bool) {
        let Some(peripheral) = self.peripheral(reference) else {
            return;
        };
        let request = WriteRequest {
            reference: reference.clone(),
            peripheral,
            characteristic,
            bytes: bytes.to_vec(),
            ack,
        };
        if self.writes.send(request).is_err() {
            warn!("Writer task has stopped");
        }
    }

    fn subscribe(&self, reference: &PeripheralRef, characteristic: Uuid) {
        let Some(peripheral) = self.peripheral(reference) else {
            return;
        };
        let reference = reference.clone();
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            let Some(c) = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == characteristic)
            else {
                return;
            };
            if let Err(e) = peripheral.subscribe(&c).await {
                warn!("Failed to subscribe: {}", e);
                return;
            }
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to open notification stream: {}", e);
                    return;
                }
            };
            while let Some(n) = notifications.next().await {
                if n.uuid != characteristic {
                    continue;
                }
                let _ = events.send(TransportEvent::Value {
                    peripheral: reference.clone(),
                    characteristic: n.uuid,
                    value: n.value,
                });
            }
            debug!("Notification stream ended");
        });
        if let Some(previous) = lock(&self.shared).notification_pump.replace(pump) {
            previous.abort();
        }
    }
}
