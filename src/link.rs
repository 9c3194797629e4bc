//! The per-link transport loop.
//!
//! One task owns the stream and the session. The loop is a three-state
//! machine: synchronize, then read requests and write responses until a
//! framing error or spurious inbound byte knocks the link back to the sync
//! state. Only stream IO errors end the loop.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::session::Session;
use crate::wire::framing::{self, LinkError};

/// Serves one BBC over any byte stream (TCP from a serial bridge, a PTY
/// adapter, an in-memory duplex in tests).
pub async fn serve_stream<S>(stream: S, session: &mut Session) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    loop {
        framing::synchronize(&mut reader, &mut writer).await?;
        debug!("link synchronized");

        loop {
            let request = match framing::read_request(&mut reader).await {
                Ok(request) => request,
                Err(LinkError::Desync(reason)) => {
                    warn!(reason, "request framing lost, resynchronizing");
                    break;
                }
                Err(LinkError::Io(err)) => return Err(err),
            };

            let Some(response) = session.handle_request(&request).await else {
                continue;
            };

            match framing::write_response(&mut reader, &mut writer, &response, false).await {
                Ok(()) => {}
                Err(LinkError::Desync(reason)) => {
                    warn!(reason, "response aborted, resynchronizing");
                    break;
                }
                Err(LinkError::Io(err)) => return Err(err),
            }
        }
    }
}
