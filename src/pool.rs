//! Fixed-size connection processing pool.
//!
//! Accepted connections are pushed into a bounded queue consumed by a fixed
//! set of long-lived workers. A full queue makes `submit` wait, which slows
//! the gateway accept loops instead of spawning unbounded work - this is the
//! system's primary backpressure mechanism. A panic while processing one
//! connection is isolated to that connection; the worker keeps serving.

use crate::gateway::Gateway;
use crate::processor::ConnectionProcessor;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// One accepted client connection awaiting processing.
///
/// Owned by exactly one worker at a time; dropping it closes the socket.
#[derive(Debug)]
pub struct PendingConnection {
    pub stream: TcpStream,
    /// The client address, after any inbound PROXY protocol unwrap.
    pub client_addr: std::net::SocketAddr,
    pub session_id: Uuid,
    pub gateway: Arc<Gateway>,
    pub accepted_at: Instant,
}

impl PendingConnection {
    pub fn new(stream: TcpStream, client_addr: std::net::SocketAddr, gateway: Arc<Gateway>) -> Self {
        Self {
            stream,
            client_addr,
            session_id: Uuid::new_v4(),
            gateway,
            accepted_at: Instant::now(),
        }
    }
}

/// Fixed-size worker pool over a bounded submission queue.
pub struct ConnectionPool {
    sender: RwLock<Option<mpsc::Sender<PendingConnection>>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ConnectionPool {
    /// Spawn `workers` worker tasks draining a queue of `queue_size` slots.
    pub fn new(workers: usize, queue_size: usize, processor: Arc<ConnectionProcessor>) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let queue = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(Self::worker_loop(
                worker_id,
                queue.clone(),
                processor.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        info!(workers, queue_size, "connection pool started");
        Arc::new(Self {
            sender: RwLock::new(Some(tx)),
            shutdown_tx,
            handles: Mutex::new(handles),
            worker_count: workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Submit a connection for processing. Waits while the queue is full;
    /// fails with `PoolClosed` after shutdown.
    pub async fn submit(&self, conn: PendingConnection) -> Result<()> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(ProxyError::PoolClosed)?;
        sender.send(conn).await.map_err(|_| ProxyError::PoolClosed)
    }

    /// Stop the pool. With `drain` the queue is emptied and in-flight work
    /// finishes; without it workers are interrupted and their sockets are
    /// closed by drop.
    pub async fn shutdown(&self, drain: bool) {
        // Closing the channel makes subsequent submits fail while letting
        // workers drain what was already queued.
        self.sender.write().await.take();
        if !drain {
            let _ = self.shutdown_tx.send(());
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        info!(drain, "connection pool stopped");
    }

    async fn worker_loop(
        worker_id: usize,
        queue: Arc<Mutex<mpsc::Receiver<PendingConnection>>>,
        processor: Arc<ConnectionProcessor>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!(worker_id, "pool worker started");
        loop {
            let conn = tokio::select! {
                conn = Self::next(&queue) => match conn {
                    Some(conn) => conn,
                    // Queue closed and drained.
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            metrics::counter!("hostgate_pool_dequeued_total", 1);

            // Process in a child task so a panic is contained to this
            // connection and the worker slot survives.
            let task = processor.clone();
            let mut handle = tokio::spawn(async move { task.process(conn).await });
            tokio::select! {
                result = &mut handle => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            metrics::counter!("hostgate_worker_panics_total", 1);
                            error!(worker_id, "connection processing panicked; worker continues");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Forced shutdown: abort the in-flight connection so its
                    // sockets close immediately.
                    handle.abort();
                    break;
                }
            }
        }
        debug!(worker_id, "pool worker stopped");
    }

    async fn next(
        queue: &Mutex<mpsc::Receiver<PendingConnection>>,
    ) -> Option<PendingConnection> {
        queue.lock().await.recv().await
    }
}
