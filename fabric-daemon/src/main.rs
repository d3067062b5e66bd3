//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod config;
mod southbound;

use clap::{App, Arg};
use config::{Config, LoggingFileRotation, LoggingFmtStyle};
use fabric_controller::Master;
use fabric_controller::error::{Error, with_source};
use fabric_controller::southbound::ChannelSouthbound;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;

fn init_tracing(config: &config::Logging) {
    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };

        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(false)
            .with_thread_ids(config.file.fmt.show_thread_id)
            .with_file(config.file.fmt.show_source)
            .with_line_number(config.file.fmt.show_source)
            .with_ansi(config.file.fmt.colors);
        let layer = match config.file.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    // Enable logging to stderr.
    let stderr = config.stderr.enabled.then(|| {
        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(config.stderr.fmt.show_thread_id)
            .with_file(config.stderr.fmt.show_source)
            .with_line_number(config.stderr.fmt.show_source)
            .with_ansi(config.stderr.fmt.colors);
        let layer = match config.stderr.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    let default_directive: Directive = "fabric=debug"
        .parse()
        .unwrap_or_else(|_| LevelFilter::DEBUG.into());
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file)
        .with(stderr)
        .init();
}

fn signal_listener() -> mpsc::Receiver<()> {
    let (signal_tx, signal_rx) = mpsc::channel(1);

    tokio::task::spawn(async move {
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            error!("failed to install signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                let _ = signal_tx.send(()).await;
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                let _ = signal_tx.send(()).await;
            }
        }
    });

    signal_rx
}

fn build_version() -> String {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    match rustc_tools_util::get_version_info!().commit_hash {
        Some(hash) => format!("{VERSION} ({hash})"),
        None => VERSION.to_owned(),
    }
}

// Prints the policy the controller would install with every declared port
// up and no host learned.
fn dry_run(config: &Config) -> Result<(), Error> {
    let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
    let mut master =
        Master::new(&config.controller, ChannelSouthbound::new(msg_tx))?;

    let switches = master
        .nib
        .topology()
        .switches()
        .map(|switch| (switch.id, switch.ports.clone()))
        .collect::<Vec<_>>();
    for (switch, ports) in switches {
        master.nib.switch_up(switch, ports);
    }

    match serde_json::to_string_pretty(&master.synthesize_policy()) {
        Ok(policy) => println!("{policy}"),
        Err(error) => error!(%error, "failed to encode policy"),
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), Error> {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut master =
        Master::new(&config.controller, ChannelSouthbound::new(msg_tx))?;

    let mut signal_rx = signal_listener();
    let _reader = southbound::read_task(event_tx);
    let writer = southbound::write_task(msg_rx);

    tokio::select! {
        _ = master.run(event_rx) => {}
        _ = signal_rx.recv() => {}
    }

    // Flush the messages still queued for the southbound runtime.
    drop(master);
    let _ = writer.await;
    Ok(())
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("Fabric SDN controller")
        .version(build_version().as_str())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .arg(
            Arg::with_name("dry-run")
                .long("dry-run")
                .help("Print the initial forwarding policy and exit."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = match Config::load(config_file) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{}", with_source(error));
            std::process::exit(1);
        }
    };

    // Initialize tracing.
    init_tracing(&config.logging);

    if matches.is_present("dry-run") {
        if let Err(error) = dry_run(&config) {
            error.log();
            std::process::exit(1);
        }
        return;
    }

    // We're ready to go!
    info!("starting up");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "failed to create async runtime");
            std::process::exit(1);
        }
    };
    if let Err(error) = runtime.block_on(run(config)) {
        error.log();
        std::process::exit(1);
    }

    info!("exiting");
}
