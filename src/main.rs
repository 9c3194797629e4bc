//! The BeebLink server binary.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beeblink::changes::ChangeQueue;
use beeblink::config::{Config, RomConfig};
use beeblink::{fs, serve_forever, ServerContext};

#[derive(Debug, Parser)]
#[command(name = "beeblink-server", about = "BBC Micro file-storage server")]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra folder to scan for volumes. Repeatable.
    #[arg(long)]
    folder: Vec<PathBuf>,

    /// Fallback ROM image served by GET_ROM.
    #[arg(long)]
    rom: Option<PathBuf>,

    /// Volume to mount when a session starts.
    #[arg(long)]
    default_volume: Option<String>,

    /// Address to listen on for links.
    #[arg(long, default_value = "127.0.0.1:48075")]
    listen: String,

    /// Hex-dump every request and response at debug level.
    #[arg(long)]
    dump_packets: bool,
}

impl Args {
    fn into_config(self) -> io::Result<(Config, String)> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.folders.extend(self.folder);
        if let Some(rom) = self.rom {
            config.roms.push(RomConfig { subtype: None, path: rom });
        }
        if self.default_volume.is_some() {
            config.default_volume = self.default_volume;
        }
        config.dump_packets |= self.dump_packets;
        Ok((config, self.listen))
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, listen) = Args::parse().into_config()?;
    if config.folders.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no volume folders configured; pass --folder or a config file",
        ));
    }

    let volumes = fs::scan_volumes(&config.folders).await?;
    if volumes.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no volumes found under the configured folders",
        ));
    }
    for volume in volumes.iter() {
        info!(name = %volume.name, path = %volume.path.display(), ty = ?volume.ty, "volume");
    }

    let (changes, _changes_task) = ChangeQueue::spawn();
    let ctx = Arc::new(ServerContext::new(
        Arc::new(volumes),
        Arc::new(config),
        Some(changes),
    ));

    let listener = TcpListener::bind(&listen).await?;
    info!(%listen, "listening");
    serve_forever(listener, ctx).await
}
