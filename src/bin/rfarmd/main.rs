mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn, Level};

use crate::args::{Args, Command, ConfigFile, ServerArgs};
use renderfarm_rs::sched::Tunables;
use renderfarm_rs::server::{Coordinator, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let Command::Server(args) = args.command;

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let file = match load_config(&args) {
        Ok(file) => file,
        Err(error) => {
            error!(%error, "failed to load config file");
            return ExitCode::from(2);
        },
    };
    let settings = args.resolve(file);

    let coord = match Coordinator::new(&settings.root, Tunables::default()) {
        Ok(coord) => Arc::new(coord),
        Err(error) => {
            error!(%error, root = %settings.root.display(), "failed to open job root");
            return ExitCode::from(2);
        },
    };
    info!(root = %settings.root.display(), "job store opened");

    let server = match Server::bind(
        (settings.listen, settings.port),
        coord,
        settings.max_frame,
    )
    .await
    {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    // Stop accepting on ctrl-c; serve() drains in-flight handlers before
    // returning.
    {
        let cancel = server.cancel_token();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

fn load_config(args: &ServerArgs) -> Result<ConfigFile> {
    let Some(path) = &args.config else {
        return Ok(ConfigFile::default());
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))
}
