//! Connection State Machine
//!
//! Owns the transport session and keeps it alive: finds the watch (saved
//! identity, then system-connected peripherals, then a filtered scan),
//! connects, discovers the UART characteristics and reconnects after every
//! loss. Once the link is up it feeds writes from the [`OutboundFramer`] and
//! notifications into the [`InboundReassembler`].
//!
//! The machine is driven entirely by calls on its owning task: transport
//! callbacks through [`TransportListener`], requests from the link service,
//! and [`ConnectionStateMachine::on_tick`] when [`deadline`] passes.
//!
//! [`deadline`]: ConnectionStateMachine::deadline

use crate::domain::commands::CONNECTED_ANNOUNCEMENT;
use crate::domain::models::{
    AppEvent, ConnectionState, MessageSeverity, PeripheralIdentity, PeripheralRef, PowerState,
    StatusMessage,
};
use crate::domain::reassembler::InboundReassembler;
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::framer::OutboundFramer;
use crate::infrastructure::bluetooth::protocol::{self, IDENTITY_KEY};
use crate::infrastructure::bluetooth::transport::{
    LinkTransport, RestoredPeripheral, TransportListener,
};
use crate::infrastructure::storage::KeyValueStore;
use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    /// Connect as soon as the radio powers on
    pub auto_connect: bool,
    /// Fixed delay before a reconnect attempt
    pub reconnect_delay: Duration,
    /// How long one scan round may run without a match
    pub scan_timeout: Duration,
    /// How long a connect request may stay unanswered
    pub connect_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl ConnectionConfig {
    pub fn from_settings(settings: &LinkSettings) -> Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.service_uuid)?,
            write_char_uuid: protocol::parse_uuid(&settings.write_char_uuid)?,
            notify_char_uuid: protocol::parse_uuid(&settings.notify_char_uuid)?,
            auto_connect: settings.auto_connect,
            reconnect_delay: settings.reconnect_delay(),
            scan_timeout: settings.scan_timeout(),
            connect_timeout: settings.connect_timeout(),
            chunk_size: settings.chunk_size,
            chunk_delay: settings.chunk_delay(),
        })
    }
}

/// The live transport session.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkHandle {
    pub peripheral: PeripheralRef,
    pub write_char: Option<Uuid>,
    pub notify_char: Option<Uuid>,
}

impl LinkHandle {
    fn new(peripheral: PeripheralRef) -> Self {
        Self {
            peripheral,
            write_char: None,
            notify_char: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    ScanRound,
    ConnectAttempt,
}

pub struct ConnectionStateMachine<T: LinkTransport> {
    transport: T,
    store: Box<dyn KeyValueStore>,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<AppEvent>,

    state: ConnectionState,
    /// Peripheral of the current attempt or link; kept across a drop so the
    /// connect can be re-issued to the same reference.
    peripheral: Option<PeripheralRef>,
    link: Option<LinkHandle>,
    /// Single in-flight timer; arming replaces it.
    timer: Option<(TimerKind, Instant)>,
    /// Set by an explicit disconnect, cleared by an explicit connect.
    user_disconnected: bool,

    framer: OutboundFramer,
    inbound: InboundReassembler,
    records: VecDeque<String>,
}

impl<T: LinkTransport> ConnectionStateMachine<T> {
    pub fn new(
        transport: T,
        store: Box<dyn KeyValueStore>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let framer = OutboundFramer::new(config.chunk_size, config.chunk_delay);
        Self {
            transport,
            store,
            config,
            events,
            state: ConnectionState::Idle,
            peripheral: None,
            link: None,
            timer: None,
            user_disconnected: false,
            framer,
            inbound: InboundReassembler::new(),
            records: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link(&self) -> Option<&LinkHandle> {
        self.link.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether a fallback reconnect is armed.
    pub fn reconnect_pending(&self) -> bool {
        matches!(self.timer, Some((TimerKind::Reconnect, _)))
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do.
    pub fn deadline(&self) -> Option<Instant> {
        let timer = self.timer.map(|(_, at)| at);
        let outbound = if self.writable().is_some() {
            self.framer.deadline()
        } else {
            None
        };
        match (timer, outbound) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Explicit connect from the user: lifts a previous [`disconnect`](Self::disconnect).
    pub fn request_connect(&mut self) {
        self.user_disconnected = false;
        self.connect();
    }

    /// Start an attempt unless one is already being served.
    pub fn connect(&mut self) {
        if self.transport.power_state() != PowerState::PoweredOn {
            debug!("Connect requested while radio is not powered on");
            return;
        }
        if self.state.is_in_flight() {
            debug!("Connect requested while {:?}; ignoring", self.state);
            return;
        }

        self.timer = None;
        self.status("Searching...", MessageSeverity::Info);

        // 1. The watch we bonded with last time
        if let Some(id) = self.load_identity() {
            if let Some(p) = self.transport.retrieve_known(&[id]).into_iter().next() {
                self.status("Found saved watch...", MessageSeverity::Info);
                self.connect_to(p);
                return;
            }
            debug!("Saved watch is not known to the system");
        }

        // 2. Already connected at the system level
        let service = self.config.service_uuid;
        if let Some(p) = self.transport.retrieve_connected_by(service).into_iter().next() {
            self.status("Re-linking connected watch...", MessageSeverity::Info);
            self.connect_to(p);
            return;
        }

        // 3. Scan
        self.status("Scanning...", MessageSeverity::Info);
        self.set_state(ConnectionState::Scanning);
        self.transport.scan(service);
        self.arm(TimerKind::ScanRound, self.config.scan_timeout);
    }

    /// The host app became active again.
    pub fn on_foreground(&mut self) {
        if self.user_disconnected {
            return;
        }
        self.connect();
    }

    /// Explicit disconnect. No reconnect until [`request_connect`](Self::request_connect).
    pub fn disconnect(&mut self) {
        self.user_disconnected = true;
        self.timer = None;

        match self.state {
            ConnectionState::Scanning => self.transport.stop_scan(),
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(p) = &self.peripheral {
                    self.transport.disconnect(p);
                }
            }
            _ => {}
        }
        self.drop_link();
        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Disconnected);
        }
        self.status("Disconnected", MessageSeverity::Info);
    }

    /// Queue a message for the watch. Dropped, with a log line, without a link.
    pub fn send(&mut self, message: &str) -> bool {
        if self.writable().is_none() {
            warn!("Failed to send, no link to the watch: {:?}", message);
            return false;
        }
        self.framer.enqueue(message);
        self.drive_outbound(Instant::now());
        true
    }

    /// Fire whatever is due at `now`.
    pub fn on_tick(&mut self, now: Instant) {
        if let Some((kind, at)) = self.timer {
            if at <= now {
                self.timer = None;
                self.fire(kind);
            }
        }
        self.drive_outbound(now);
    }

    /// Records completed since the last call, in arrival order.
    pub fn take_records(&mut self) -> Vec<String> {
        self.records.drain(..).collect()
    }

    fn fire(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Reconnect | TimerKind::ConnectAttempt => {
                if self.state == ConnectionState::Connecting {
                    self.abandon_attempt();
                }
                if !self.user_disconnected {
                    debug!(?kind, "Reconnect timer fired");
                    self.connect();
                }
            }
            TimerKind::ScanRound => {
                if self.state == ConnectionState::Scanning {
                    info!("No watch found in this scan round");
                    self.transport.stop_scan();
                    self.set_state(ConnectionState::Disconnected);
                    self.status("Watch not found", MessageSeverity::Warning);
                    self.arm(TimerKind::Reconnect, self.config.reconnect_delay);
                }
            }
        }
    }

    fn drive_outbound(&mut self, now: Instant) {
        let Some((peripheral, write_char)) = self.writable() else {
            let dropped = self.framer.clear();
            if dropped > 0 {
                warn!("Link lost, dropped {} queued message(s)", dropped);
            }
            return;
        };
        let peripheral = peripheral.clone();
        if let Some(bytes) = self.framer.poll(now) {
            self.transport.write(&peripheral, write_char, &bytes, true);
        }
    }

    fn writable(&self) -> Option<(&PeripheralRef, Uuid)> {
        let link = self.link.as_ref()?;
        Some((&link.peripheral, link.write_char?))
    }

    fn connect_to(&mut self, peripheral: PeripheralRef) {
        info!(peripheral = %peripheral.id, "Connecting");
        self.transport.connect(&peripheral);
        self.peripheral = Some(peripheral);
        self.set_state(ConnectionState::Connecting);
        self.arm(TimerKind::ConnectAttempt, self.config.connect_timeout);
    }

    /// Give up on a connect request the stack never answered.
    fn abandon_attempt(&mut self) {
        if let Some(p) = &self.peripheral {
            warn!(peripheral = %p.id, "Connect attempt was never answered");
            self.transport.disconnect(p);
        }
        self.set_state(ConnectionState::Failed);
        self.set_state(ConnectionState::Disconnected);
        self.status("Connection attempt timed out", MessageSeverity::Warning);
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.timer = Some((kind, Instant::now() + delay));
    }

    fn is_current(&self, peripheral: &PeripheralRef) -> bool {
        self.peripheral
            .as_ref()
            .is_some_and(|p| p.id == peripheral.id)
    }

    fn is_linked(&self, peripheral: &PeripheralRef) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.peripheral.id == peripheral.id)
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.inbound.reset();
        let dropped = self.framer.clear();
        if dropped > 0 {
            warn!("Link lost, dropped {} queued message(s)", dropped);
        }
    }

    fn establish(&mut self, peripheral: PeripheralRef) {
        self.timer = None;
        self.inbound.reset();
        self.save_identity(&peripheral.id);
        self.transport
            .discover_services(&peripheral, &[self.config.service_uuid]);
        self.link = Some(LinkHandle::new(peripheral.clone()));
        self.peripheral = Some(peripheral);
        self.set_state(ConnectionState::Connected);
        self.status("Connected", MessageSeverity::Success);
    }

    fn load_identity(&self) -> Option<PeripheralIdentity> {
        match self.store.get(IDENTITY_KEY) {
            Ok(id) => id.map(PeripheralIdentity::new),
            Err(e) => {
                warn!("Could not read saved watch identity: {}", e);
                None
            }
        }
    }

    fn save_identity(&self, id: &PeripheralIdentity) {
        if let Err(e) = self.store.set(IDENTITY_KEY, id.as_str()) {
            warn!("Could not save watch identity: {}", e);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Link state {:?} -> {:?}", self.state, state);
        self.state = state;
        let _ = self.events.send(AppEvent::ConnectionState(state));
    }

    fn status(&self, message: &str, severity: MessageSeverity) {
        info!("{}", message);
        let _ = self.events.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl<T: LinkTransport> TransportListener for ConnectionStateMachine<T> {
    fn on_power_state(&mut self, state: PowerState) {
        if state == PowerState::PoweredOn {
            self.status("Bluetooth ready", MessageSeverity::Info);
            if self.config.auto_connect && !self.user_disconnected {
                self.connect();
            }
            return;
        }

        self.status("Bluetooth unavailable", MessageSeverity::Warning);
        self.timer = None;
        self.drop_link();
        self.set_state(ConnectionState::Idle);
    }

    fn on_discover(&mut self, peripheral: PeripheralRef) {
        if self.state != ConnectionState::Scanning {
            debug!(peripheral = %peripheral.id, "Discovery outside a scan; ignoring");
            return;
        }
        self.transport.stop_scan();
        self.timer = None;
        self.status(
            &format!("Found {}", peripheral.display_name()),
            MessageSeverity::Info,
        );
        self.connect_to(peripheral);
    }

    fn on_connect(&mut self, peripheral: PeripheralRef) {
        if !self.is_current(&peripheral) || self.state == ConnectionState::Connected {
            debug!(peripheral = %peripheral.id, "Unexpected connect event; ignoring");
            return;
        }
        if self.user_disconnected {
            self.transport.disconnect(&peripheral);
            return;
        }
        self.establish(peripheral);
    }

    fn on_fail_to_connect(&mut self, peripheral: PeripheralRef, error: String) {
        if !self.is_current(&peripheral) || self.state != ConnectionState::Connecting {
            return;
        }
        warn!(peripheral = %peripheral.id, "Connection failed: {}", error);
        self.set_state(ConnectionState::Failed);
        self.set_state(ConnectionState::Disconnected);
        self.status(
            &format!("Connection failed: {}", error),
            MessageSeverity::Warning,
        );
        if !self.user_disconnected {
            self.arm(TimerKind::Reconnect, self.config.reconnect_delay);
        }
    }

    fn on_disconnect(&mut self, peripheral: PeripheralRef, error: Option<String>) {
        if !self.is_current(&peripheral) {
            return;
        }
        if self.state == ConnectionState::Connecting && self.link.is_none() {
            // Echo of an abandoned attempt; the new one keeps its deadline
            debug!(peripheral = %peripheral.id, "Disconnect while connecting; ignoring");
            return;
        }
        match &error {
            Some(e) => warn!(peripheral = %peripheral.id, "Link lost: {}", e),
            None => info!(peripheral = %peripheral.id, "Link closed"),
        }
        self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        self.status("Disconnected", MessageSeverity::Warning);

        if self.user_disconnected || self.transport.power_state() != PowerState::PoweredOn {
            return;
        }

        // Re-issue to the same reference right away; the fallback abandons it
        // if it is never honored.
        self.connect_to(peripheral);
        self.arm(TimerKind::Reconnect, self.config.reconnect_delay);
    }

    fn on_services_discovered(&mut self, peripheral: PeripheralRef, services: Vec<Uuid>) {
        if !self.is_linked(&peripheral) {
            return;
        }
        let service = self.config.service_uuid;
        if services.contains(&service) {
            self.transport.discover_characteristics(&peripheral, service);
        } else {
            warn!(peripheral = %peripheral.id, "Watch does not expose the UART service");
            self.status("UART service not found", MessageSeverity::Error);
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristics: Vec<Uuid>,
    ) {
        if !self.is_linked(&peripheral) || service != self.config.service_uuid {
            return;
        }
        let write_char = self.config.write_char_uuid;
        let notify_char = self.config.notify_char_uuid;

        if characteristics.contains(&notify_char) {
            self.transport.subscribe(&peripheral, notify_char);
        } else {
            warn!("Notify characteristic not found");
        }

        let has_write = characteristics.contains(&write_char);
        if let Some(link) = self.link.as_mut() {
            link.notify_char = characteristics.contains(&notify_char).then_some(notify_char);
            link.write_char = has_write.then_some(write_char);
        }

        if has_write {
            self.send(CONNECTED_ANNOUNCEMENT);
        } else {
            warn!("Write characteristic not found");
        }
    }

    fn on_value(&mut self, peripheral: PeripheralRef, characteristic: Uuid, value: Vec<u8>) {
        let subscribed = self
            .link
            .as_ref()
            .is_some_and(|l| l.peripheral.id == peripheral.id && l.notify_char == Some(characteristic));
        if !subscribed {
            debug!(%characteristic, "Notification from an unexpected source; ignoring");
            return;
        }
        self.records.extend(self.inbound.push(&value));
    }

    fn on_restore_state(&mut self, restored: Vec<RestoredPeripheral>) {
        let Some(first) = restored.into_iter().next() else {
            return;
        };
        info!(peripheral = %first.peripheral.id, connected = first.connected, "Restoring link");
        if first.connected {
            self.establish(first.peripheral);
        } else {
            self.connect_to(first.peripheral);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::storage::MemoryStore;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Scan,
        StopScan,
        RetrieveKnown(Vec<String>),
        RetrieveConnected,
        Connect(String),
        Disconnect(String),
        DiscoverServices(String),
        DiscoverCharacteristics(String),
        Write(Vec<u8>),
        Subscribe(Uuid),
    }

    pub(crate) struct FakeState {
        pub power: PowerState,
        pub known: Vec<PeripheralRef>,
        pub connected: Vec<PeripheralRef>,
        pub calls: Vec<Call>,
    }

    #[derive(Clone)]
    pub(crate) struct FakeTransport(pub Arc<Mutex<FakeState>>);

    impl FakeTransport {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(FakeState {
                power: PowerState::PoweredOn,
                known: Vec::new(),
                connected: Vec::new(),
                calls: Vec::new(),
            })))
        }

        pub fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        pub fn clear_calls(&self) {
            self.0.lock().unwrap().calls.clear();
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Write(bytes) => Some(bytes),
                    _ => None,
                })
                .collect()
        }

        fn push(&self, call: Call) {
            self.0.lock().unwrap().calls.push(call);
        }
    }

    impl LinkTransport for FakeTransport {
        fn power_state(&self) -> PowerState {
            self.0.lock().unwrap().power
        }
        fn scan(&self, _service: Uuid) {
            self.push(Call::Scan);
        }
        fn stop_scan(&self) {
            self.push(Call::StopScan);
        }
        fn retrieve_known(&self, ids: &[PeripheralIdentity]) -> Vec<PeripheralRef> {
            self.push(Call::RetrieveKnown(
                ids.iter().map(|i| i.as_str().to_string()).collect(),
            ));
            let state = self.0.lock().unwrap();
            state
                .known
                .iter()
                .filter(|p| ids.contains(&p.id))
                .cloned()
                .collect()
        }
        fn retrieve_connected_by(&self, _service: Uuid) -> Vec<PeripheralRef> {
            self.push(Call::RetrieveConnected);
            self.0.lock().unwrap().connected.clone()
        }
        fn connect(&self, peripheral: &PeripheralRef) {
            self.push(Call::Connect(peripheral.id.to_string()));
        }
        fn disconnect(&self, peripheral: &PeripheralRef) {
            self.push(Call::Disconnect(peripheral.id.to_string()));
        }
        fn discover_services(&self, peripheral: &PeripheralRef, _services: &[Uuid]) {
            self.push(Call::DiscoverServices(peripheral.id.to_string()));
        }
        fn discover_characteristics(&self, peripheral: &PeripheralRef, _service: Uuid) {
            self.push(Call::DiscoverCharacteristics(peripheral.id.to_string()));
        }
        fn write(&self, _peripheral: &PeripheralRef, _characteristic: Uuid, bytes: &[u8], ack: bool) {
            assert!(ack, "chunk writes request acknowledgment");
            self.push(Call::Write(bytes.to_vec()));
        }
        fn subscribe(&self, _peripheral: &PeripheralRef, characteristic: Uuid) {
            self.push(Call::Subscribe(characteristic));
        }
    }

    type Machine = ConnectionStateMachine<FakeTransport>;

    fn config() -> ConnectionConfig {
        ConnectionConfig::from_settings(&LinkSettings::default()).unwrap()
    }

    fn watch() -> PeripheralRef {
        PeripheralRef::new("watch-1").with_name("Bangle.js 1a2b")
    }

    fn machine_with(store: MemoryStore) -> (Machine, FakeTransport, mpsc::UnboundedReceiver<AppEvent>) {
        let transport = FakeTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Machine::new(
            transport.clone(),
            Box::new(store),
            config(),
            tx,
        );
        (machine, transport, rx)
    }

    fn machine() -> (Machine, FakeTransport) {
        let (machine, transport, _rx) = machine_with(MemoryStore::new());
        (machine, transport)
    }

    /// Drive a machine to a fully discovered link.
    fn connected() -> (Machine, FakeTransport) {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        m.on_connect(watch());
        let config = config();
        m.on_services_discovered(watch(), vec![config.service_uuid]);
        m.on_characteristics_discovered(
            watch(),
            config.service_uuid,
            vec![config.write_char_uuid, config.notify_char_uuid],
        );
        (m, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connect_without_power() {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().power = PowerState::PoweredOff;
        m.connect();
        assert_eq!(m.state(), ConnectionState::Idle);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scans_when_nothing_is_known() {
        let (mut m, transport) = machine();
        m.connect();
        assert_eq!(m.state(), ConnectionState::Scanning);
        assert_eq!(transport.calls(), vec![Call::RetrieveConnected, Call::Scan]);

        m.on_discover(watch());
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(
            &transport.calls()[2..],
            &[Call::StopScan, Call::Connect("watch-1".into())]
        );

        // Late advertisement from another device is not tracked
        m.on_discover(PeripheralRef::new("other"));
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_identity_is_tried_first() {
        let (mut m, transport, _rx) =
            machine_with(MemoryStore::with_entry(IDENTITY_KEY, "watch-1"));
        transport.0.lock().unwrap().known.push(watch());
        m.connect();
        assert_eq!(
            transport.calls(),
            vec![
                Call::RetrieveKnown(vec!["watch-1".into()]),
                Call::Connect("watch-1".into())
            ]
        );
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_saved_identity_falls_through() {
        let (mut m, transport, _rx) =
            machine_with(MemoryStore::with_entry(IDENTITY_KEY, "gone"));
        m.connect();
        assert_eq!(
            transport.calls(),
            vec![
                Call::RetrieveKnown(vec!["gone".into()]),
                Call::RetrieveConnected,
                Call::Scan
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_connected_peripheral_is_relinked() {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        assert_eq!(
            transport.calls(),
            vec![Call::RetrieveConnected, Call::Connect("watch-1".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_while_in_flight() {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        m.connect();
        m.on_foreground();
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);

        m.on_connect(watch());
        m.connect();
        m.request_connect();
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_persists_identity_and_announces() {
        let (m, transport) = connected();
        assert_eq!(m.store.get(IDENTITY_KEY).unwrap(), Some("watch-1".to_string()));
        assert_eq!(m.state(), ConnectionState::Connected);

        let config = config();
        let calls = transport.calls();
        assert!(calls.contains(&Call::DiscoverServices("watch-1".into())));
        assert!(calls.contains(&Call::DiscoverCharacteristics("watch-1".into())));
        assert!(calls.contains(&Call::Subscribe(config.notify_char_uuid)));
        assert_eq!(
            transport.writes(),
            protocol::encode_message(CONNECTED_ANNOUNCEMENT, config.chunk_size)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_reissue_is_abandoned_and_retried() {
        let (mut m, transport) = connected();
        transport.clear_calls();

        m.on_disconnect(watch(), Some("timeout".into()));
        assert_eq!(transport.calls(), vec![Call::Connect("watch-1".into())]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(m.reconnect_pending());
        assert!(m.link().is_none());

        // The stack never answers the re-issued connect
        tokio::time::advance(Duration::from_secs(2)).await;
        m.on_tick(Instant::now());
        assert_eq!(
            &transport.calls()[1..],
            &[
                Call::Disconnect("watch-1".into()),
                Call::RetrieveKnown(vec!["watch-1".into()]),
                Call::RetrieveConnected,
                Call::Connect("watch-1".into())
            ]
        );
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.deadline(), Some(Instant::now() + Duration::from_secs(10)));

        // The stack confirms the abandoned attempt is gone
        m.on_disconnect(watch(), None);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 2);

        // Still silent: every attempt keeps a deadline, so retries never stop
        for round in 3..6 {
            tokio::time::advance(Duration::from_secs(10)).await;
            m.on_tick(Instant::now());
            assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), round);
            assert!(m.deadline().is_some());
        }

        // A late answer to the current attempt still links up
        m.on_connect(watch());
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_attempt_publishes_failure() {
        let (mut m, transport, mut rx) = machine_with(MemoryStore::new());
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        while rx.try_recv().is_ok() {}

        tokio::time::advance(Duration::from_secs(10)).await;
        m.on_tick(Instant::now());

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ConnectionState(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Failed,
                ConnectionState::Disconnected,
                ConnectionState::Connecting
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_discovery_connect_rescans() {
        let (mut m, transport) = machine();
        m.connect();
        m.on_discover(watch());
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.deadline(), Some(Instant::now() + Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(9999)).await;
        m.on_tick(Instant::now());
        assert_eq!(m.state(), ConnectionState::Connecting);

        tokio::time::advance(Duration::from_millis(1)).await;
        m.on_tick(Instant::now());
        assert!(transport.calls().contains(&Call::Disconnect("watch-1".into())));
        assert_eq!(m.state(), ConnectionState::Scanning);
        assert_eq!(transport.count(|c| *c == Call::Scan), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_retries_after_fixed_delay() {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        m.on_fail_to_connect(watch(), "refused".into());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.reconnect_pending());

        tokio::time::advance(Duration::from_millis(1999)).await;
        m.on_tick(Instant::now());
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        m.on_tick(Instant::now());
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 2);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_timer() {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        m.on_fail_to_connect(watch(), "refused".into());
        let first = m.deadline().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        m.state = ConnectionState::Connecting;
        m.on_fail_to_connect(watch(), "refused again".into());
        let second = m.deadline().unwrap();
        assert_eq!(second - first, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        m.on_tick(Instant::now());
        // Only the replacement is live, so nothing fires yet
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_reconnects_from_disconnected() {
        let (mut m, transport) = machine();
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        m.on_fail_to_connect(watch(), "refused".into());
        m.on_foreground();
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(!m.reconnect_pending());
        assert_eq!(m.deadline(), Some(Instant::now() + Duration::from_secs(10)));
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_round_timeout_backs_off() {
        let (mut m, transport) = machine();
        m.connect();
        tokio::time::advance(Duration::from_secs(30)).await;
        m.on_tick(Instant::now());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(transport.calls().contains(&Call::StopScan));
        assert!(m.reconnect_pending());

        tokio::time::advance(Duration::from_secs(2)).await;
        m.on_tick(Instant::now());
        assert_eq!(m.state(), ConnectionState::Scanning);
        assert_eq!(transport.count(|c| *c == Call::Scan), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_link_is_dropped() {
        let (mut m, transport) = machine();
        assert!(!m.send("Buzz"));
        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_paced() {
        let (mut m, transport) = connected();
        transport.clear_calls();
        tokio::time::advance(Duration::from_millis(50)).await;

        let long = "x".repeat(300);
        assert!(m.send(&long));
        assert_eq!(transport.writes().len(), 1);

        // The second chunk is not due until the delay has passed
        m.on_tick(Instant::now());
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(m.deadline(), Some(Instant::now() + Duration::from_millis(50)));

        tokio::time::advance(Duration::from_millis(50)).await;
        m.on_tick(Instant::now());
        tokio::time::advance(Duration::from_millis(50)).await;
        m.on_tick(Instant::now());
        assert_eq!(transport.writes(), protocol::encode_message(&long, 140));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_become_records() {
        let (mut m, _transport) = connected();
        let notify = config().notify_char_uuid;
        m.on_value(watch(), notify, b"hello ".to_vec());
        assert!(m.take_records().is_empty());
        m.on_value(watch(), notify, b"world\nFind".to_vec());
        assert_eq!(m.take_records(), vec!["hello world"]);

        // Partial record does not survive a link loss
        m.on_disconnect(watch(), None);
        m.on_connect(watch());
        m.on_characteristics_discovered(
            watch(),
            config().service_uuid,
            vec![notify],
        );
        m.on_value(watch(), notify, b"Phone\n".to_vec());
        assert_eq!(m.take_records(), vec!["Phone"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_with_live_link_skips_connect() {
        let (mut m, transport) = machine();
        m.on_restore_state(vec![RestoredPeripheral {
            peripheral: watch(),
            connected: true,
        }]);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(
            transport.calls(),
            vec![Call::DiscoverServices("watch-1".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_without_link_connects_directly() {
        let (mut m, transport) = machine();
        m.on_restore_state(vec![RestoredPeripheral {
            peripheral: watch(),
            connected: false,
        }]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(transport.calls(), vec![Call::Connect("watch-1".into())]);

        // The restored reference never answers
        tokio::time::advance(Duration::from_secs(10)).await;
        m.on_tick(Instant::now());
        assert_eq!(
            &transport.calls()[1..],
            &[
                Call::Disconnect("watch-1".into()),
                Call::RetrieveConnected,
                Call::Scan
            ]
        );
        assert_eq!(m.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_suppresses_reconnect() {
        let (mut m, transport) = connected();
        transport.clear_calls();
        m.disconnect();
        assert_eq!(transport.calls(), vec![Call::Disconnect("watch-1".into())]);

        m.on_disconnect(watch(), None);
        m.on_foreground();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.reconnect_pending());
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 0);

        m.request_connect();
        assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_loss_returns_to_idle() {
        let (mut m, transport) = connected();
        transport.0.lock().unwrap().power = PowerState::PoweredOff;
        m.on_power_state(PowerState::PoweredOff);
        assert_eq!(m.state(), ConnectionState::Idle);
        assert!(m.link().is_none());
        assert_eq!(m.deadline(), None);

        transport.0.lock().unwrap().power = PowerState::PoweredOn;
        m.on_power_state(PowerState::PoweredOn);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_published() {
        let (mut m, transport, mut rx) = machine_with(MemoryStore::new());
        transport.0.lock().unwrap().connected.push(watch());
        m.connect();
        m.on_connect(watch());

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ConnectionState(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }
}
