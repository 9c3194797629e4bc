//! BeebLink - a file-storage and disk-image server for the BBC Micro.

pub mod browser;
pub mod changes;
pub mod commands;
pub mod config;
pub mod error;
pub mod fs;
pub mod gsread;
pub mod image;
pub mod inf;
pub mod link;
pub mod session;
pub mod speedtest;
pub mod wire;

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub use session::{ServerContext, Session};

/// Accepts connections and serves each one as an independent session.
pub async fn serve_forever(listener: TcpListener, ctx: Arc<ServerContext>) -> io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;

        socket.set_nodelay(true)?;

        info!(%peer, "link connected");
        process_socket(socket, ctx.clone());
    }
}

fn process_socket(socket: TcpStream, ctx: Arc<ServerContext>) {
    tokio::spawn(async move {
        let Some(mut session) = Session::new(&ctx) else {
            debug!("no volumes available, dropping connection");
            return;
        };
        match link::serve_stream(socket, &mut session).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                info!("link disconnected");
            }
            Err(err) => {
                debug!(%err, "link failed");
            }
        }
    });
}
