//! Worker-pool TCP server (§4.D): the hardest component. Separates
//! accepting sockets, reading framed messages off each socket, and
//! processing messages -- accept and read are cheap and per-connection;
//! processing (JSON parse + log publish) runs on a fixed worker pool fed
//! by a bounded, drop-on-full queue so a slow worker never backpressures
//! the socket reader.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::log::LogProducer;
use crate::model::{RawSample, RawSampleData};
use crate::protocol::{self, ClientMessage, ServerAck};
use crate::registry::{ConnectionId, ConnectionRegistry, SessionRecord};
use crate::scheduler::EventScheduler;

pub const RAW_METRIC_TOPIC: &str = "raw-metric";

/// Maximum single line length accepted from a client before the
/// connection is treated as misbehaving. Bounds memory for a client that
/// never sends a newline.
const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub identify_timeout: Duration,
    pub inactivity_timeout: Duration,
    /// 0 means "4 x cpu-core-count", resolved by `resolved_worker_count`.
    pub worker_count: usize,
    pub job_queue_size: usize,
    /// When false, a reader processes its own frames inline instead of
    /// handing them to the worker pool -- useful for low-volume
    /// deployments where the extra hop isn't worth the indirection.
    pub use_worker_pool: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_connections: 10_000,
            identify_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(120),
            worker_count: 0,
            job_queue_size: 2000,
            use_worker_pool: true,
        }
    }
}

impl ServerConfig {
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            4 * num_cpus::get()
        } else {
            self.worker_count
        }
    }
}

/// A unit of work handed from a reader to the worker pool. Metrics jobs
/// are fire-and-forget (no ack); keepalive jobs carry the write half so a
/// worker can reply without the reader blocking on socket I/O.
struct Job {
    connection_id: ConnectionId,
    location: String,
    label: String,
    raw: Vec<u8>,
    received_at: DateTime<Utc>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

pub struct IngestServer<P: LogProducer + 'static> {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<EventScheduler>,
    producer: Arc<P>,
}

impl<P: LogProducer + 'static> std::fmt::Debug for IngestServer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestServer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<P: LogProducer + 'static> IngestServer<P> {
    pub fn new(config: ServerConfig, scheduler: Arc<EventScheduler>, producer: Arc<P>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        Self { config, registry, scheduler, producer }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Runs the accept loop and worker pool until `cancel` fires. Mirrors
    /// §4.D.5: cancel stops new accepts, lets in-flight readers observe
    /// cancellation and close their sockets, then drains the job queue.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(port = self.config.port, "ingestion server listening");
        self.serve(listener, cancel).await
    }

    /// Runs the accept loop against an already-bound listener. Split out
    /// from `run` so tests can bind to an ephemeral port and learn the
    /// real address before the server starts accepting.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<(), Error> {
        let (job_tx, job_rx) = mpsc::channel::<Job>(self.config.job_queue_size);
        let job_rx = Arc::new(AsyncMutex::new(job_rx));

        let worker_count = self.config.resolved_worker_count();
        let mut worker_handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let server = self.clone();
            let job_rx = job_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                server.worker_loop(worker_id, job_rx).await;
            }));
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            if self.registry.count() >= self.config.max_connections {
                                debug!(%addr, "rejecting connection: registry at capacity");
                                drop(socket);
                                continue;
                            }
                            let server = self.clone();
                            let job_tx = job_tx.clone();
                            let reader_cancel = cancel.clone();
                            tokio::spawn(async move {
                                server.handle_connection(socket, job_tx, reader_cancel).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        drop(job_tx);
        for handle in worker_handles {
            let _ = handle.await;
        }
        info!("ingestion server shut down");
        Ok(())
    }

    async fn handle_connection(&self, socket: TcpStream, job_tx: mpsc::Sender<Job>, cancel: CancellationToken) {
        let _ = socket.set_nodelay(true);
        let (read_half, write_half) = socket.into_split();
        let writer = Arc::new(AsyncMutex::new(write_half));
        let mut reader = BufReader::new(read_half);

        let connection_id = match self.identify(&mut reader, &writer, cancel.clone()).await {
            Ok(session) => session,
            Err(_) => return,
        };

        self.steady_state(connection_id, reader, writer, job_tx, cancel).await;
    }

    /// §4.D.1 step 2: the identify window. Reads exactly one frame under
    /// `identify_timeout`; anything other than a valid identify results in
    /// `ack:error` and close.
    async fn identify(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &Arc<AsyncMutex<OwnedWriteHalf>>,
        cancel: CancellationToken,
    ) -> Result<ConnectionId, ()> {
        let mut line = Vec::new();
        let read = tokio::select! {
            res = tokio::time::timeout(self.config.identify_timeout, read_frame(reader, &mut line)) => res,
            _ = cancel.cancelled() => return Err(()),
        };

        let frame = match read {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                return Err(()); // EOF before identify
            }
            Ok(Err(e)) => {
                warn!(error = %e, "read error during identify");
                return Err(());
            }
            Err(_) => {
                self.send_ack(writer, ServerAck::error("identify timeout")).await;
                return Err(());
            }
        };

        let message = match protocol::parse(&frame) {
            Ok(ClientMessage::Identify { zipcode, city }) => (zipcode, city),
            Ok(_) => {
                self.send_ack(writer, ServerAck::error("first frame must be identify")).await;
                return Err(());
            }
            Err(e) => {
                self.send_ack(writer, ServerAck::error(e.to_string())).await;
                return Err(());
            }
        };

        let (zipcode, city) = message;
        let connection_id = Uuid::new_v4();
        let record = Arc::new(SessionRecord::new(connection_id, zipcode, city));

        if let Err(e) = self.registry.register(record) {
            let status = match e {
                Error::RegistryFull { .. } => "server at capacity",
                Error::DuplicateConnection(_) => "duplicate connection id",
                _ => "registration failed",
            };
            self.send_ack(writer, ServerAck::error(status)).await;
            return Err(());
        }

        self.send_ack(writer, ServerAck::identified()).await;
        self.arm_inactivity(connection_id, writer.clone());
        Ok(connection_id)
    }

    /// §4.D.1 step 4 / §4.D.4: steady-state read loop. Every successful
    /// frame refreshes activity and reschedules the inactivity timer
    /// (replace-by-id, so exactly one inactivity event exists per
    /// connection); metrics/keepalive frames are offered to the bounded
    /// worker queue without blocking.
    async fn steady_state(
        &self,
        connection_id: ConnectionId,
        mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: Arc<AsyncMutex<OwnedWriteHalf>>,
        job_tx: mpsc::Sender<Job>,
        cancel: CancellationToken,
    ) {
        let per_read_timeout = Duration::from_secs(5);
        let mut line = Vec::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            line.clear();
            let read = tokio::time::timeout(per_read_timeout, read_frame(&mut reader, &mut line)).await;

            match read {
                Ok(Ok(Some(frame))) => {
                    self.registry.update_activity(connection_id);
                    self.arm_inactivity(connection_id, writer.clone());

                    let session = self.registry.get(connection_id);
                    let Some(session) = session else { break };

                    let job = Job {
                        connection_id,
                        location: session.location.clone(),
                        label: session.label.clone(),
                        raw: frame,
                        received_at: Utc::now(),
                        writer: writer.clone(),
                    };
                    if self.config.use_worker_pool {
                        if job_tx.try_send(job).is_err() {
                            warn!(%connection_id, "job queue full, dropping frame");
                        }
                    } else {
                        self.process_job(job).await;
                    }
                }
                Ok(Ok(None)) => break, // EOF
                Ok(Err(e)) => {
                    debug!(%connection_id, error = %e, "socket error, closing connection");
                    break;
                }
                Err(_) => continue, // per-read timeout: loop to recheck cancellation
            }
        }

        self.cleanup(connection_id).await;
    }

    async fn cleanup(&self, connection_id: ConnectionId) {
        self.registry.unregister(connection_id);
        self.scheduler.cancel(&inactivity_event_id(connection_id));
        debug!(%connection_id, "connection cleaned up");
    }

    fn arm_inactivity(&self, connection_id: ConnectionId, writer: Arc<AsyncMutex<OwnedWriteHalf>>) {
        let registry = self.registry.clone();
        let timeout = self.config.inactivity_timeout;
        let id = inactivity_event_id(connection_id);

        let _ = self.scheduler.schedule_in(
            id,
            timeout,
            Box::new(move || {
                Box::pin(async move {
                    registry.unregister(connection_id);
                    let mut w = writer.lock().await;
                    let _ = w.shutdown().await;
                })
            }),
        );
    }

    async fn send_ack(&self, writer: &Arc<AsyncMutex<OwnedWriteHalf>>, ack: ServerAck) {
        let bytes = ack.encode();
        let mut w = writer.lock().await;
        if let Err(e) = w.write_all(&bytes).await {
            debug!(error = %e, "failed to write ack");
        }
    }

    /// Per §4.D.5, a worker exits only once the job queue is closed
    /// (`job_tx` dropped after the accept loop returns), not on
    /// cancellation directly -- otherwise shutdown could race an
    /// already-enqueued job out from under a worker instead of draining
    /// it first.
    async fn worker_loop(&self, worker_id: usize, job_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = job_rx.lock().await.recv().await;
            let Some(job) = job else { break };
            self.process_job(job).await;
        }
        debug!(worker_id, "worker exiting");
    }

    /// §4.D.3: parses the raw bytes; metrics frames are published to the
    /// producer with no ack (fire-and-forget at the protocol level);
    /// keepalive frames get `ack:alive`. Parse failures are logged and
    /// discarded.
    async fn process_job(&self, job: Job) {
        match protocol::parse(&job.raw) {
            Ok(ClientMessage::Metrics { timestamp, data }) => {
                let sample = RawSample {
                    connection_id: job.connection_id,
                    location: job.location,
                    label: job.label,
                    received_at: job.received_at,
                    data: RawSampleData { timestamp, metrics: data },
                };
                match serde_json::to_vec(&sample) {
                    Ok(payload) => {
                        if let Err(e) = self.producer.publish(RAW_METRIC_TOPIC, &sample.location, &payload).await {
                            warn!(error = %e, "failed to publish raw sample, dropping");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to encode raw sample"),
                }
            }
            Ok(ClientMessage::Keepalive) => {
                self.send_ack(&job.writer, ServerAck::alive()).await;
            }
            Ok(ClientMessage::Identify { .. }) => {
                debug!("ignoring stray identify frame after session start");
            }
            Err(e) => {
                debug!(error = %e, "discarding unparseable frame");
            }
        }
    }
}

fn inactivity_event_id(connection_id: ConnectionId) -> String {
    format!("inactivity:{connection_id}")
}

/// Reads one newline-terminated frame, trimming the delimiter. Returns
/// `Ok(None)` on clean EOF with no partial data.
async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<Vec<u8>>> {
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
    }
    Ok(Some(std::mem::take(buf)))
}
