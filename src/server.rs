use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Context;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{connection::Connection, pool::ThreadPool};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// TCP acceptor. Only enqueues; never handles a connection itself.
pub struct RtspServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RtspServer {
    pub fn bind(addr: &str, pool: Arc<ThreadPool<Connection>>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("binding RTSP on {}", addr))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name("rtsp-accept".to_string())
            .spawn(move || accept_loop(listener, pool, loop_cancel))
            .context("spawning RTSP acceptor")?;

        log::info!("RTSP server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            cancel,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept thread.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("RTSP acceptor panicked");
            }
            log::info!("RTSP server on {} stopped", self.local_addr);
        }
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, pool: Arc<ThreadPool<Connection>>, cancel: CancellationToken) {
    let mut next_id: u64 = 1;
    while !cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("accept {}: {}", peer, e);
                    continue;
                }
                let conn = match Connection::new(next_id, stream) {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::debug!("accept {}: {}", peer, e);
                        continue;
                    }
                };
                log::debug!("accepted connection {} from {}", next_id, peer);
                next_id += 1;
                if !pool.add_work(conn) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}
