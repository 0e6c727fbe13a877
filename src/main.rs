use clap::Parser;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use star_projector::characteristic::{Characteristic, Reading};
use star_projector::config::PlatformConfig;
use star_projector::registry::{Accessory, Registry};
use star_projector::session::EventKinds;
use star_projector::transport::{DeviceEvent, LocalClient, Transport};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs the star projector bridge until interrupted.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Platform configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// File holding the accessory names registered by the previous run
    #[arg(long, default_value = "accessories.json")]
    cache: PathBuf,

    /// Log at debug level regardless of the configuration
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match PlatformConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let level = if config.debug || args.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("star-projector {}", star_projector::version());

    let registry = Registry::build(&config, |device| {
        let client = LocalClient::builder(&device.device_id, &device.local_key)
            .address(device.address.clone())
            .version(device.version)
            .build()?;
        Ok(Arc::new(client) as Arc<dyn Transport>)
    });

    sync_cache(&registry, &args.cache);

    let cancel = CancellationToken::new();
    for accessory in registry.accessories() {
        observe(accessory, &cancel);
    }
    for session in registry.sessions() {
        let name = session.name().to_string();
        let events = session
            .subscribe(EventKinds::LINK | EventKinds::ERROR)
            .into_stream();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::pin!(events);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(DeviceEvent::Connected) => info!("{} connected", name),
                        Some(DeviceEvent::Disconnected) => warn!("{} disconnected", name),
                        Some(DeviceEvent::Error(e)) => warn!("{} reported: {}", name, e),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
    }

    registry.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    cancel.cancel();
    registry.shutdown().await;
}

/// Logs the host-visible changes of every characteristic of an accessory.
fn observe(accessory: &Accessory, cancel: &CancellationToken) {
    let name = accessory.name().to_string();
    match accessory {
        Accessory::Projector(p) => {
            let services = p.services();
            info!(
                "{}: {} {} (serial {}, firmware {})",
                name,
                p.info().manufacturer,
                p.info().model,
                p.info().serial_number,
                p.info().firmware_revision
            );
            watch(format!("{} power", name), &services.power, cancel);
            if let Some(rotation) = &services.rotation {
                watch(format!("{} rotation", name), &rotation.active, cancel);
                watch(format!("{} rotation speed", name), &rotation.speed, cancel);
            }
            if let Some(color) = &services.color {
                watch(format!("{} colour", name), &color.on, cancel);
                watch(format!("{} hue", name), &color.hue, cancel);
                watch(format!("{} saturation", name), &color.saturation, cancel);
                watch(format!("{} colour brightness", name), &color.brightness, cancel);
            }
            if let Some(laser) = &services.laser {
                watch(format!("{} laser", name), &laser.on, cancel);
                watch(format!("{} laser brightness", name), &laser.brightness, cancel);
            }
        }
        Accessory::Scene(s) => {
            info!("{}: scene for {}", name, s.linked_to());
            watch(name, &s.services().switch, cancel);
        }
    }
}

fn watch<T>(label: String, characteristic: &Characteristic<T>, cancel: &CancellationToken)
where
    T: Copy + PartialOrd + Debug + Send + Sync + 'static,
{
    let mut rx = characteristic.subscribe();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match *rx.borrow_and_update() {
                        Reading::Value(v) => info!("{} = {:?}", label, v),
                        Reading::Unreachable => debug!("{} unreachable", label),
                    }
                }
            }
        }
    });
}

/// Reconciles against the names saved by the last run, then saves the
/// current set.
fn sync_cache(registry: &Registry, path: &Path) {
    let cached: Vec<String> = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    let plan = registry.reconcile(cached.as_slice());
    for name in &plan.register {
        info!("Registering accessory {}", name);
    }

    let names: Vec<&str> = registry.accessories().iter().map(Accessory::name).collect();
    let written = serde_json::to_string_pretty(&names)
        .map_err(|e| e.to_string())
        .and_then(|text| std::fs::write(path, text).map_err(|e| e.to_string()));
    if let Err(e) = written {
        warn!("Could not save accessory cache {}: {}", path.display(), e);
    }
}
