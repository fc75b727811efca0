//! Bluetooth Service Module
//!
//! Main service that owns the connection state machine on a single task and
//! coordinates it with the rest of the application: transport callbacks,
//! requests from [`LinkClient`] handles and timer expiries are all handled
//! here, one at a time.

use crate::domain::commands::{CommandDispatcher, OutboundSink};
use crate::domain::models::AppEvent;
use crate::domain::reassembler::BackgroundExecution;
use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use crate::infrastructure::bluetooth::transport::{EventReceiver, LinkTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Requests accepted by the link service.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Send(String),
    Connect,
    Disconnect,
    Foreground,
    Shutdown,
}

/// Cloneable handle to a running [`BluetoothService`].
#[derive(Debug, Clone)]
pub struct LinkClient {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkClient {
    /// Queue a message for the watch. Dropped if the link is down.
    pub fn send(&self, message: impl Into<String>) {
        self.request(LinkCommand::Send(message.into()));
    }

    pub fn connect(&self) {
        self.request(LinkCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.request(LinkCommand::Disconnect);
    }

    /// The host came back to the foreground.
    pub fn notify_foreground(&self) {
        self.request(LinkCommand::Foreground);
    }

    pub fn shutdown(&self) {
        self.request(LinkCommand::Shutdown);
    }

    /// A handle that does not keep the service alive.
    pub fn downgrade(&self) -> WeakLinkClient {
        WeakLinkClient {
            commands: self.commands.downgrade(),
        }
    }

    fn request(&self, command: LinkCommand) {
        if self.commands.send(command).is_err() {
            debug!("Link service has stopped");
        }
    }
}

impl OutboundSink for LinkClient {
    fn send(&self, message: &str) {
        LinkClient::send(self, message);
    }
}

/// Non-owning [`LinkClient`], used where the service would otherwise hold
/// a handle to itself.
#[derive(Debug, Clone)]
pub struct WeakLinkClient {
    commands: mpsc::WeakUnboundedSender<LinkCommand>,
}

impl OutboundSink for WeakLinkClient {
    fn send(&self, message: &str) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(LinkCommand::Send(message.to_string()));
        }
    }
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<T: LinkTransport> {
    machine: ConnectionStateMachine<T>,
    transport_events: EventReceiver,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    dispatcher: Option<CommandDispatcher>,
    background: Arc<dyn BackgroundExecution>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: LinkTransport> BluetoothService<T> {
    /// Create a new Bluetooth service and the client that drives it
    pub fn new(
        machine: ConnectionStateMachine<T>,
        transport_events: EventReceiver,
        background: Arc<dyn BackgroundExecution>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, LinkClient) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            machine,
            transport_events,
            commands: rx,
            dispatcher: None,
            background,
            event_sender,
        };
        (service, LinkClient { commands: tx })
    }

    /// Route completed inbound records through `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: CommandDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Run until shut down or every [`LinkClient`] is dropped.
    pub async fn run(mut self) -> ConnectionStateMachine<T> {
        info!("Link service started");
        loop {
            let deadline = self.machine.deadline();
            tokio::select! {
                event = self.transport_events.recv() => match event {
                    Some(event) => event.deliver(&mut self.machine),
                    None => {
                        info!("Transport closed its event channel");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = wait_until(deadline) => {}
            }
            self.machine.on_tick(Instant::now());
            self.drain_records();
        }
        info!("Link service stopped");
        self.machine
    }

    fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Send(message) => {
                self.machine.send(&message);
            }
            LinkCommand::Connect => self.machine.request_connect(),
            LinkCommand::Disconnect => self.machine.disconnect(),
            LinkCommand::Foreground => self.machine.on_foreground(),
            LinkCommand::Shutdown => {}
        }
    }

    fn drain_records(&mut self) {
        for record in self.machine.take_records() {
            // Held until this record has been handled
            let _task = self.background.begin("inbound record");
            debug!("Record from watch: {:?}", record);
            let _ = self
                .event_sender
                .send(AppEvent::RecordReceived(record.clone()));
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch(&record);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
