//! TCP ingestion listener
//!
//! Newline-delimited text protocol, one ingestion session per connection.
//! A rejected line is answered with `-ERR <reason>` and the connection
//! stays open.

use crate::protocol::{ingest_line, LineError};
use ridgeline_core::storage::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Longest accepted line
const MAX_LINE: usize = 64 * 1024;

pub async fn serve(
    listener: TcpListener,
    db: Arc<Database>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("TCP listener on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let db = db.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, db, shutdown).await {
                        debug!(%peer, "Connection closed: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("TCP listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    db: Arc<Database>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    debug!(%peer, "Connection accepted");
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut dispatcher = db.create_session();
    let mut line = Vec::new();

    loop {
        line.clear();
        let (n, too_long) = tokio::select! {
            read = read_line(&mut reader, &mut line) => read?,
            _ = shutdown.changed() => break,
        };
        if n == 0 {
            break;
        }
        if too_long {
            write.write_all(b"-ERR line too long\r\n").await?;
            continue;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        // Writes may fsync, keep them off the reactor
        let result = tokio::task::block_in_place(|| ingest_line(&mut dispatcher, &line));
        if let Err(e) = result {
            if let LineError::Engine(err) = &e {
                if err.is_backpressure() {
                    warn!(%peer, "Write rejected: {}", err);
                    // Runs a checkpoint inline when no checkpointer is running
                    let db = db.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || db.request_checkpoint()).await {
                        warn!("Checkpoint request failed: {}", e);
                    }
                }
            }
            write
                .write_all(format!("-ERR {}\r\n", e).as_bytes())
                .await?;
        }
    }
    debug!(%peer, "Connection finished");
    Ok(())
}

/// Read one line of at most `MAX_LINE` bytes. The rest of a longer line is
/// consumed and dropped; the second value tells whether that happened.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut n = (&mut *reader)
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', line)
        .await?;
    if line.len() <= MAX_LINE || line.ends_with(b"\n") {
        return Ok((n, false));
    }

    let mut rest = Vec::new();
    loop {
        rest.clear();
        let m = (&mut *reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut rest)
            .await?;
        n += m;
        if m == 0 || rest.ends_with(b"\n") {
            break;
        }
    }
    line.clear();
    Ok((n, true))
}
