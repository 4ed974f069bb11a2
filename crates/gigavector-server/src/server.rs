//! Acceptor thread + fixed-size worker pool over a FIFO task queue
//! (spec.md §4.14/§5: "one acceptor thread + a fixed-size worker pool fed
//! by a FIFO task queue... a worker owns a connection for its lifetime and
//! processes requests sequentially").

use crate::engine::Engine;
use crate::handlers::handle_connection;
use crossbeam_channel::{bounded, Sender};
use gigavector_core::config::ServerConfig;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Queue depth beyond which the acceptor drops new connections outright,
/// rather than let the task queue grow without bound (spec.md §5's
/// back-pressure clause). Independent from `max_connections`, which bounds
/// *admitted* (accepted) connections, queued or in flight.
const QUEUE_HIGH_WATER_MARK: usize = 1024;

/// A bound, not-yet-running server: an acceptor loop plus `thread_pool_size`
/// worker threads are spawned by [`Server::start`].
pub struct Server {
    listener: TcpListener,
    engine: Arc<Engine>,
    config: ServerConfig,
}

/// A running server's handle. Dropping it without calling [`ServerHandle::stop`]
/// leaves the acceptor and worker threads detached but running.
pub struct ServerHandle {
    stop_flag: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds `config.bind_address:config.port`. Does not yet accept
    /// connections — call [`Server::start`].
    ///
    /// # Errors
    ///
    /// Whatever `TcpListener::bind` returns (e.g. address already in use).
    pub fn bind(engine: Arc<Engine>, config: ServerConfig) -> std::io::Result<Self> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, engine, config })
    }

    /// Starts the fixed-size worker pool and the acceptor loop, returning
    /// immediately with a handle the caller uses to [`ServerHandle::stop`]
    /// later. Idempotent failure (a fresh call) is structural here: each
    /// call to `start` produces an independent acceptor/pool pair, so
    /// calling it twice on the same bound listener would race both
    /// acceptors on the same socket — callers should only call this once
    /// per `Server`.
    #[must_use]
    pub fn start(self) -> ServerHandle {
        let Self { listener, engine, config } = self;
        let stop_flag = Arc::new(AtomicBool::new(false));

        let (tx, rx) = bounded::<TcpStream>(QUEUE_HIGH_WATER_MARK);

        let workers = (0..config.thread_pool_size.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let engine = Arc::clone(&engine);
                std::thread::Builder::new()
                    .name(format!("gigavector-worker-{worker_id}"))
                    .spawn(move || {
                        while let Ok(stream) = rx.recv() {
                            if let Err(err) = handle_connection(&stream, &engine) {
                                tracing::debug!(%err, "connection closed with error");
                            }
                            engine.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        let acceptor = {
            let stop_flag = Arc::clone(&stop_flag);
            let engine = Arc::clone(&engine);
            let max_connections = config.max_connections;
            std::thread::Builder::new()
                .name("gigavector-acceptor".to_string())
                .spawn(move || acceptor_loop(listener, tx, stop_flag, engine, max_connections))
                .expect("failed to spawn acceptor thread")
        };

        ServerHandle { stop_flag, acceptor: Some(acceptor), workers }
    }
}

fn acceptor_loop(listener: TcpListener, tx: Sender<TcpStream>, stop_flag: Arc<AtomicBool>, engine: Arc<Engine>, max_connections: usize) {
    while !stop_flag.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                // Admission control (spec.md §4.14): reject outright once
                // already-admitted connections reach the configured cap.
                if engine.stats.active_connections.load(Ordering::Relaxed) as usize >= max_connections {
                    drop(stream);
                    continue;
                }
                let _ = stream.set_nodelay(true);
                engine.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                // Back-pressure (spec.md §5): a full queue means the
                // caller would otherwise see unbounded memory growth, so
                // the connection is closed immediately with no response.
                if tx.try_send(stream).is_err() {
                    tracing::warn!("worker queue full, dropping connection");
                    engine.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::error!(%e, "acceptor error");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl ServerHandle {
    /// Shuts down the listener, unblocks the acceptor, signals workers
    /// (by dropping the task queue's sender, which the acceptor thread
    /// owns and drops on exit), and joins every thread. Queued-but-not-yet-
    /// started connections are dropped, closing their sockets.
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
