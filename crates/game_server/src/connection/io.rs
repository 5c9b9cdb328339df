//! Socket tasks of a connection.
//!
//! Every connection runs two tasks: the receive loop feeding its
//! [`ByteQueue`](shard_protocol::ByteQueue) and the send loop draining its
//! grams. Both stop when the connection's shutdown signal fires.

use super::NetState;
use shard_protocol::Gram;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Starts both socket tasks of a freshly accepted connection and moves it to
/// the running state.
pub(crate) fn spawn(
    runtime: &Handle,
    ns: Arc<NetState>,
    stream: TcpStream,
    grams: mpsc::UnboundedReceiver<Gram>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Client: {}: Failed to set TCP_NODELAY: {}", ns, e);
    }
    let (reader, writer) = stream.into_split();

    if !ns.set_running() {
        return;
    }
    runtime.spawn(receive_loop(ns.clone(), reader));
    runtime.spawn(send_loop(ns, writer, grams));
}

/// Resolves once the flag holds `value`. Returns `false` if the sender is
/// gone.
async fn wait_until(flag: &mut watch::Receiver<bool>, value: bool) -> bool {
    flag.wait_for(|current| *current == value).await.is_ok()
}

async fn receive_loop(ns: Arc<NetState>, mut reader: OwnedReadHalf) {
    let ctx = ns.ctx().clone();
    let mut buffer = ctx.pools.receive.acquire();
    let mut paused = ctx.pause.subscribe();
    let mut shutdown = ns.subscribe_shutdown();

    loop {
        tokio::select! {
            resumed = wait_until(&mut paused, false) => {
                if !resumed {
                    break;
                }
            }
            _ = wait_until(&mut shutdown, true) => break,
        }

        let read = tokio::select! {
            read = reader.read(&mut buffer[..]) => read,
            _ = wait_until(&mut shutdown, true) => break,
            _ = wait_until(&mut paused, true) => continue,
        };

        match read {
            Ok(0) => {
                trace!("Client: {}: Remote closed the connection", ns);
                ns.dispose(false);
                break;
            }
            Ok(count) => ns.on_received(&buffer[..count]),
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
            Err(e) => {
                debug!("Client: {}: Receive failed: {}", ns, e);
                ns.dispose(false);
                break;
            }
        }
    }
}

/// Writes `gram` and every gram queued behind it.
async fn write_chain(ns: &NetState, writer: &mut OwnedWriteHalf, mut gram: Gram) -> io::Result<()> {
    loop {
        writer.write_all(gram.as_bytes()).await?;
        ns.touch();
        match ns.next_gram(gram) {
            Some(next) => gram = next,
            None => return Ok(()),
        }
    }
}

async fn send_loop(
    ns: Arc<NetState>,
    mut writer: OwnedWriteHalf,
    mut grams: mpsc::UnboundedReceiver<Gram>,
) {
    let flush_timeout = ns.ctx().flush_timeout;
    let mut shutdown = ns.subscribe_shutdown();
    let mut deadline = None;
    let mut healthy = true;

    loop {
        let next = tokio::select! {
            biased;
            gram = grams.recv() => gram,
            _ = wait_until(&mut shutdown, true) => None,
        };
        let Some(gram) = next else { break };

        let chain = write_chain(&ns, &mut writer, gram);
        tokio::pin!(chain);
        let written = tokio::select! {
            written = &mut chain => written,
            _ = wait_until(&mut shutdown, true) => {
                if !ns.lingers() {
                    break;
                }
                let until = *deadline.get_or_insert_with(|| Instant::now() + flush_timeout);
                match timeout_at(until, &mut chain).await {
                    Ok(written) => written,
                    Err(_) => Err(io::ErrorKind::TimedOut.into()),
                }
            }
        };

        if let Err(e) = written {
            debug!("Client: {}: Send failed: {}", ns, e);
            healthy = false;
            ns.dispose(false);
            break;
        }
    }

    if healthy && ns.lingers() {
        let until = deadline.unwrap_or_else(|| Instant::now() + flush_timeout);
        let drain = async {
            while let Some(gram) = grams.try_recv().ok().or_else(|| ns.take_flush_ready()) {
                write_chain(&ns, &mut writer, gram).await?;
            }
            Ok::<(), io::Error>(())
        };
        match timeout_at(until, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Client: {}: Flush on dispose failed: {}", ns, e),
            Err(_) => debug!("Client: {}: Flush on dispose timed out", ns),
        }
    }

    let _ = writer.shutdown().await;
}
