use anyhow::Result;
use bluewatch_link::domain::commands::CommandDispatcher;
use bluewatch_link::domain::device::DeviceProfile;
use bluewatch_link::domain::location::{Location, LocationRequests};
use bluewatch_link::domain::models::{AppEvent, MessageSeverity, PowerState};
use bluewatch_link::domain::reassembler::Unrestricted;
use bluewatch_link::domain::settings::{Settings, SettingsService};
use bluewatch_link::infrastructure::alarm::{FindPhoneAlarm, TerminalBell};
use bluewatch_link::infrastructure::bluetooth::connection::{
    ConnectionConfig, ConnectionStateMachine,
};
use bluewatch_link::infrastructure::bluetooth::protocol::IDENTITY_KEY;
use bluewatch_link::infrastructure::bluetooth::simulator::SimulatedWatch;
use bluewatch_link::infrastructure::bluetooth::transport::{EventReceiver, LinkTransport};
use bluewatch_link::infrastructure::bluetooth::{BluetoothService, LinkClient};
use bluewatch_link::infrastructure::logging::init_logger;
use bluewatch_link::infrastructure::storage::{JsonFileStore, KeyValueStore};
use bluewatch_link::infrastructure::telemetry::JsonlTelemetryRecorder;
use bluewatch_link::infrastructure::weather::{
    serve_fixed_location, ConfiguredWeatherProvider, WeatherPusher,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bluewatch", version, about = "Companion link for Bangle.js watches")]
struct Cli {
    /// Settings file to use instead of the per-user one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Talk to an in-process simulated watch instead of the radio
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Keep the watch linked and relay a console (default)
    Run,
    /// Show the saved watch and where settings live
    Status,
    /// Forget the saved watch
    Forget,
    /// Change settings and write them to the settings file
    Config {
        /// Connect as soon as the radio is available
        #[arg(long)]
        auto_connect: Option<bool>,
        /// Push weather to the watch
        #[arg(long)]
        weather: Option<bool>,
        /// Minutes between weather pushes (5, 10, 30 or 60)
        #[arg(long)]
        weather_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => SettingsService::load(path.clone()),
        None => SettingsService::new()?,
    };
    let data_dir = SettingsService::data_dir()?;
    let _log_guard = init_logger(&settings.get().log_settings, &data_dir)?;
    let store = JsonFileStore::new(data_dir.join("state.json"));

    match cli.command.unwrap_or(Command::Run) {
        Command::Status => {
            println!("Settings: {}", settings.path().display());
            match store.get(IDENTITY_KEY)? {
                Some(id) => println!("Saved watch: {}", id),
                None => println!("Saved watch: none"),
            }
            Ok(())
        }
        Command::Forget => {
            store.remove(IDENTITY_KEY)?;
            println!("Saved watch forgotten");
            Ok(())
        }
        Command::Config {
            auto_connect,
            weather,
            weather_interval,
        } => {
            settings.update(|s| {
                if let Some(auto_connect) = auto_connect {
                    s.link.auto_connect = auto_connect;
                }
                if let Some(enabled) = weather {
                    s.weather.enabled = enabled;
                }
                if let Some(minutes) = weather_interval {
                    s.weather.interval_minutes = minutes;
                }
            })?;
            println!("Settings written to {}", settings.path().display());
            Ok(())
        }
        Command::Run => {
            info!("Starting BlueWatch link");
            run(settings.get().clone(), data_dir, store, cli.simulate).await
        }
    }
}

async fn run(settings: Settings, data_dir: PathBuf, store: JsonFileStore, simulate: bool) -> Result<()> {
    let config = ConnectionConfig::from_settings(&settings.link)?;
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (app_tx, app_rx) = mpsc::unbounded_channel();

    if simulate {
        let watch = SimulatedWatch::new(transport_tx, &config);
        let machine =
            ConnectionStateMachine::new(watch.clone(), Box::new(store), config, app_tx.clone());
        return run_link(machine, transport_rx, app_tx, app_rx, &settings, &data_dir, Some(watch))
            .await;
    }

    #[cfg(feature = "ble")]
    {
        use bluewatch_link::infrastructure::bluetooth::platform::BtleplugTransport;
        let transport = BtleplugTransport::start(transport_tx).await?;
        let machine = ConnectionStateMachine::new(transport, Box::new(store), config, app_tx.clone());
        run_link(machine, transport_rx, app_tx, app_rx, &settings, &data_dir, None).await
    }

    #[cfg(not(feature = "ble"))]
    {
        drop((transport_tx, transport_rx, app_tx, app_rx, store, config, data_dir));
        anyhow::bail!("built without the `ble` feature; pass --simulate to use a simulated watch")
    }
}

async fn run_link<T: LinkTransport + 'static>(
    machine: ConnectionStateMachine<T>,
    transport_rx: EventReceiver,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    app_rx: mpsc::UnboundedReceiver<AppEvent>,
    settings: &Settings,
    data_dir: &std::path::Path,
    simulated: Option<SimulatedWatch>,
) -> Result<()> {
    let recorder = JsonlTelemetryRecorder::open(data_dir.join("health.jsonl"))?;
    let alarm = FindPhoneAlarm::new(Arc::new(TerminalBell::default()));

    let (service, client) =
        BluetoothService::new(machine, transport_rx, Arc::new(Unrestricted), app_tx);
    let dispatcher = CommandDispatcher::new(
        Box::new(recorder),
        Box::new(alarm),
        Box::new(client.downgrade()),
    );
    let service_task = tokio::spawn(service.with_dispatcher(dispatcher).run());
    let report_task = tokio::spawn(report_events(app_rx));

    let weather_task = settings.weather.enabled.then(|| {
        let locations = Arc::new(LocationRequests::new());
        let fix = Location {
            latitude: settings.weather.latitude,
            longitude: settings.weather.longitude,
        };
        tokio::spawn(serve_fixed_location(locations.clone(), fix));
        let provider = ConfiguredWeatherProvider::new(settings.weather.clone(), locations);
        let pusher = WeatherPusher::new(
            provider,
            client.clone(),
            DeviceProfile::default(),
            settings.weather.interval(),
        );
        tokio::spawn(pusher.run())
    });

    if let Some(watch) = &simulated {
        watch.set_power(PowerState::PoweredOn);
    }

    console(&client, simulated.as_ref()).await?;

    if let Some(task) = weather_task {
        task.abort();
    }
    client.shutdown();
    service_task.await?;
    report_task.abort();
    info!("Link closed");
    Ok(())
}

/// Relay console lines to the watch until `/quit`, EOF or Ctrl-C.
async fn console(client: &LinkClient, simulated: Option<&SimulatedWatch>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => return Ok(()),
            ("/connect", _) => client.connect(),
            ("/disconnect", _) => client.disconnect(),
            ("/reconnect", _) => client.notify_foreground(),
            ("/watch", text) => match simulated {
                Some(watch) => watch.notify(text),
                None => warn!("/watch needs --simulate"),
            },
            ("/drop", _) => match simulated {
                Some(watch) => watch.drop_link(),
                None => warn!("/drop needs --simulate"),
            },
            _ => client.send(line),
        }
    }
}

async fn report_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::ConnectionState(state) => println!("[link] {:?}", state),
            AppEvent::LogMessage(status) => match status.severity {
                MessageSeverity::Warning | MessageSeverity::Error => {
                    println!("[!] {}", status.message)
                }
                _ => println!("[-] {}", status.message),
            },
            AppEvent::RecordReceived(record) => println!("[watch] {}", record),
        }
    }
}
