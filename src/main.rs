use std::{
    io, process,
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use iotc_lite::{
    config::Config,
    core::{
        C2dCommand, C2dOta, Callbacks, CommandAckStatus, OtaAckStatus, Primitive, SessionManager,
        TelemetryValue, TelemetryValues, TokenWaiter, Waiter,
    },
    logger::LoggerManager,
    print_error,
};
use iotc_mqtt::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Messages handed from the network thread to the main loop.
enum Inbound {
    Command(C2dCommand),
    Ota(C2dOta),
}

/// Cancels `token` on Ctrl+C.
fn spawn_signal_listener(token: CancellationToken) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    thread::Builder::new()
        .name("iotc-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    token.cancel();
                }
            })
        })?;
    Ok(())
}

fn callbacks(inbound: mpsc::Sender<Inbound>) -> Callbacks {
    let ota_inbound = inbound.clone();
    Callbacks::new()
        .on_command(move |command| {
            if inbound.send(Inbound::Command(command.clone())).is_err() {
                warn!("Main loop gone, dropping command {}", command.raw);
            }
        })
        .on_ota(move |ota| {
            if ota_inbound.send(Inbound::Ota(ota.clone())).is_err() {
                warn!("Main loop gone, dropping OTA update");
            }
        })
        .on_disconnected(|reason, from_server| {
            warn!(
                "Device disconnected: {} (initiated by {})",
                reason,
                if from_server { "server" } else { "client" }
            );
        })
}

/// Acknowledges queued commands and OTA notices.
fn handle_inbound<T: Transport>(session: &SessionManager<T>, inbound: &mpsc::Receiver<Inbound>) {
    for message in inbound.try_iter() {
        let result = match message {
            Inbound::Command(command) => {
                info!("Received command {} {:?}", command.name, command.args);
                match command.name.as_str() {
                    "echo" => session.send_command_ack(
                        &command,
                        CommandAckStatus::SuccessWithAck,
                        &command.args.join(" "),
                    ),
                    _ => session.send_command_ack(
                        &command,
                        CommandAckStatus::Failed,
                        &format!("Unknown command \"{}\"", command.name),
                    ),
                }
            }
            Inbound::Ota(ota) => {
                for url in &ota.urls {
                    info!("OTA file {} available at {}", url.file_name, url.url);
                }
                session.send_ota_ack(&ota, OtaAckStatus::Failed, "OTA is not supported by this demo")
            }
        };
        if let Err(e) = result {
            error!("Failed to send acknowledgement: {}", e);
        }
    }
}

fn sample(started: Instant, sequence: u64) -> TelemetryValues {
    let mut values = TelemetryValues::new();
    values
        .insert("sdk_version", env!("CARGO_PKG_VERSION"))
        .insert("uptime_secs", started.elapsed().as_secs())
        .insert("sequence", sequence)
        .insert(
            "location",
            Primitive::geo(44.787197, 20.457273).unwrap_or(Primitive::Null),
        )
        .insert(
            "status",
            TelemetryValue::object([("ok", Primitive::from(true)), ("errors", Primitive::from(0))]),
        );
    values
}

fn main() {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting iotc-lite version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.settings);

    let device = cfg.device.to_device_config().unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });
    info!(
        "Device {} on {} (cpid {}, env {})",
        device.duid, device.platform, device.cpid, device.env
    );

    let cancel = CancellationToken::new();
    if let Err(e) = spawn_signal_listener(cancel.clone()) {
        error!("Failed to install Ctrl+C handler: {}", e);
        process::exit(1);
    }

    let (inbound_tx, inbound_rx) = mpsc::channel();
    let mut session = SessionManager::from_device_config(&device, callbacks(inbound_tx), cfg.settings.clone())
        .and_then(|session| session.with_cancellation(cancel.clone()))
        .unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        });

    let pause = TokenWaiter::new(cancel.clone()).unwrap_or_else(|e| {
        error!("Failed to create timer: {}", e);
        process::exit(1);
    });
    let interval = Duration::from_secs(cfg.demo.interval_secs);
    let started = Instant::now();
    let mut sequence = 0u64;

    while !cancel.is_cancelled() {
        if !session.is_connected() {
            info!("(re)connecting...");
            let state = session.connect();
            if cancel.is_cancelled() {
                break;
            }
            if !state.is_connected() {
                error!("Unable to connect: {}. Exiting.", state.details());
                process::exit(2);
            }
        }

        handle_inbound(&session, &inbound_rx);

        sequence += 1;
        match session.send_telemetry(sample(started, sequence), None) {
            Ok(Some(receipt)) => debug!("Sent {} bytes to {}", receipt.bytes, receipt.topic),
            Ok(None) => {}
            Err(e) => error!("Failed to send telemetry: {}", e),
        }

        if !pause.wait(interval) {
            break;
        }
    }

    if let Err(e) = session.disconnect() {
        error!("Disconnect failed: {}", e);
    }
    info!("Shutdown complete");
}
