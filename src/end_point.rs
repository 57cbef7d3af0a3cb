use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::connection_pool::{ConnectionPool, StreamIdAllocator};
use crate::error::TransportError;
use crate::segment::{Segment, SegmentKind, SEGMENT_MAX};
use crate::send_pipeline::SendPipeline;

/// Fixed byte string exchanged during the handshake. Opaque; both sides must
///  agree on it.
const HANDSHAKE_KEY: &[u8] = b"trudp-handshake-v1";

/// State shared by the read loop, the GC loop and the public endpoint types.
struct EndpointCore {
    socket: Arc<UdpSocket>,
    pipeline: SendPipeline,
    config: Arc<Config>,
    stream_ids: StreamIdAllocator,
    pool: ConnectionPool,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    shutdown: CancellationToken,
}

impl EndpointCore {
    fn new(socket: UdpSocket, config: Arc<Config>) -> (Arc<EndpointCore>, mpsc::Receiver<Arc<Connection>>) {
        let socket = Arc::new(socket);
        let pipeline = SendPipeline::new(Arc::new(socket.clone()));
        let (accept_tx, accept_rx) = mpsc::channel(1);

        let core = Arc::new(EndpointCore {
            socket,
            pipeline,
            config: config.clone(),
            stream_ids: StreamIdAllocator::new(),
            pool: ConnectionPool::new(config),
            accept_tx,
            shutdown: CancellationToken::new(),
        });
        (core, accept_rx)
    }

    /// Read datagrams forever, demultiplexing to the connection registered for
    ///  the sender address and registering unknown senders on first contact.
    async fn read_loop(self: Arc<Self>) {
        info!("starting read loop on {:?}", self.pipeline.local_addr());

        let mut buf = vec![0u8; SEGMENT_MAX];
        loop {
            let (len, from) = select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => return,
            };

            self.dispatch(&buf[..len], from).await;
        }
    }

    async fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let conn = match self.pool.get(from) {
            Some(conn) => conn,
            None => {
                let stream_id = self.stream_ids.allocate();
                match self.pool.insert(self.pipeline.clone(), from, stream_id) {
                    Ok(conn) => {
                        debug!("first contact from {}: registered {}", from, conn);
                        select! {
                            _ = self.accept_tx.send(conn.clone()) => {}
                            _ = self.shutdown.cancelled() => return,
                        }
                        conn
                    }
                    Err(e) => {
                        error!("registering peer {} failed: {}", from, e);
                        self.stream_ids.release(stream_id);
                        self.send_rejection_notice(from).await;
                        return;
                    }
                }
            }
        };

        if let Err(e) = conn.handle(datagram).await {
            warn!("handling datagram from {} failed: {}", from, e);
        }
    }

    async fn send_rejection_notice(&self, to: SocketAddr) {
        match Segment::new(
            SegmentKind::Ack,
            0,
            0,
            0,
            0,
            b"error: failed to register connection".to_vec(),
        ) {
            Ok(notice) => {
                if let Err(e) = self.pipeline.send_segment(to, &notice).await {
                    debug!("sending rejection notice to {} failed: {}", to, e);
                }
            }
            Err(e) => error!("building rejection notice failed: {}", e),
        }
    }

    /// Reap idle and closed connections, handing their stream ids back.
    async fn gc_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.gc_interval);
        loop {
            select! {
                _ = ticker.tick() => {
                    for conn in self.pool.garbage_collect() {
                        self.stream_ids.release(conn.stream_id());
                    }
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }
}

/// The passive endpoint: owns the datagram socket and hands out one
///  [Connection] per peer as they make first contact.
///
/// Must be created from within a tokio runtime; the read and GC loops are
///  spawned as independent tasks and aborted when the server is dropped.
pub struct Server {
    core: Arc<EndpointCore>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(socket: UdpSocket) -> anyhow::Result<Server> {
        Self::with_config(socket, Config::default())
    }

    pub fn with_config(socket: UdpSocket, config: Config) -> anyhow::Result<Server> {
        config.validate()?;

        let (core, accept_rx) = EndpointCore::new(socket, Arc::new(config));

        let tasks = vec![
            tokio::spawn(core.clone().read_loop()),
            tokio::spawn(core.clone().gc_loop()),
        ];

        Ok(Server {
            core,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            tasks,
        })
    }

    /// Wait for the next previously unknown peer to make contact.
    pub async fn accept(&self) -> Result<Arc<Connection>, TransportError> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx
            .recv()
            .await
            .ok_or(TransportError::ConnectionShutdown)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.pipeline.local_addr()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The active endpoint: performs the handshake against a server, then runs the
///  same read loop plus a keepalive ping loop for the resulting connection.
pub struct Client {
    core: Arc<EndpointCore>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Handshake with `remote` and return the established connection. Retries
    ///  failed handshakes on a fixed cadence, so this only resolves once the
    ///  server answered correctly.
    pub async fn connect(
        socket: UdpSocket,
        remote: SocketAddr,
    ) -> anyhow::Result<(Client, Arc<Connection>)> {
        Self::connect_with_config(socket, remote, Config::default()).await
    }

    pub async fn connect_with_config(
        socket: UdpSocket,
        remote: SocketAddr,
        config: Config,
    ) -> anyhow::Result<(Client, Arc<Connection>)> {
        config.validate()?;

        let (core, accept_rx) = EndpointCore::new(socket, Arc::new(config));

        let conn = loop {
            match Self::handshake(&core, remote).await {
                Ok(conn) => break conn,
                Err(e) => {
                    warn!("handshake with {} failed: {} - retrying", remote, e);
                    sleep(core.config.handshake_retry).await;
                }
            }
        };
        info!("handshake with {} complete: {}", remote, conn);

        let tasks = vec![
            tokio::spawn(core.clone().read_loop()),
            tokio::spawn(core.clone().gc_loop()),
            tokio::spawn(Self::ping_loop(core.clone(), conn.clone())),
        ];

        // the client never accepts inbound peers; dropping the receiver makes
        //  the read loop ignore strangers
        drop(accept_rx);

        Ok((Client { core, tasks }, conn))
    }

    async fn handshake(
        core: &Arc<EndpointCore>,
        remote: SocketAddr,
    ) -> anyhow::Result<Arc<Connection>> {
        let syn = Segment::new(SegmentKind::Syn, 0, 0, 0, 0, HANDSHAKE_KEY.to_vec())?;
        core.pipeline.send_segment(remote, &syn).await?;

        let mut buf = vec![0u8; SEGMENT_MAX];
        let (len, from) = timeout(core.config.handshake_retry, core.socket.recv_from(&mut buf)).await??;
        if from != remote {
            warn!("handshake reply from unexpected address {}", from);
        }

        let segment = Segment::deser(&buf[..len])?;
        if segment.kind != SegmentKind::Ack {
            bail!("handshake reply is {:?}, not Ack", segment.kind);
        }
        if segment.body != HANDSHAKE_KEY {
            bail!("handshake reply carries a mismatched key");
        }

        // adopt the stream id the server assigned
        core.pool
            .insert(core.pipeline.clone(), remote, segment.stream_id)
            .map_err(Into::into)
    }

    async fn ping_loop(core: Arc<EndpointCore>, conn: Arc<Connection>) {
        loop {
            if let Err(e) = conn.ping().await {
                debug!("keepalive ping to {} failed: {}", conn.remote_addr(), e);
            }
            select! {
                _ = sleep(core.config.ping_interval) => {}
                _ = conn.shutdown_token().cancelled() => return,
                _ = core.shutdown.cancelled() => return,
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.pipeline.local_addr()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}
