use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use renderfarm_rs::wire::DEFAULT_MAX_FRAME;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the render farm coordinator until interrupted.
    Server(ServerArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Path to a YAML config file; flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Address to listen on.
    #[arg(short, long)]
    pub listen: Option<IpAddr>,
    /// (TCP) port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Directory holding per-job state.
    #[arg(short, long)]
    pub root: Option<PathBuf>,
    /// Sets the maximum accepted request frame size in bytes.
    #[arg(short = 'z', long)]
    pub max_frame: Option<u32>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}

/// On-disk configuration; every field has a flag override.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub root: Option<PathBuf>,
    pub max_frame: Option<u32>,
}

/// Fully resolved server settings.
#[derive(Debug)]
pub struct Settings {
    pub listen: IpAddr,
    pub port: u16,
    pub root: PathBuf,
    pub max_frame: u32,
}

impl ServerArgs {
    pub fn resolve(&self, file: ConfigFile) -> Settings {
        Settings {
            listen: self
                .listen
                .or(file.listen)
                .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))),
            port: self.port.or(file.port).unwrap_or(9401),
            root: self
                .root
                .clone()
                .or(file.root)
                .unwrap_or_else(|| PathBuf::from("rfarm-data")),
            max_frame: self
                .max_frame
                .or(file.max_frame)
                .unwrap_or(DEFAULT_MAX_FRAME),
        }
    }
}
