use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::control_messages::{
    QueryReceiveResponse, RequestHeader, REQUEST_KIND_QUERY_RECEIVE,
};
use crate::error::TransportError;
use crate::receive_buffer::ReceiveBuffer;
use crate::segment::{Segment, SegmentKind};
use crate::send_buffer::{SendBuffer, MAX_MESSAGE_SIZE};
use crate::send_pipeline::SendPipeline;

/// Correlation table for in-flight one-shot exchanges (inner requests, pings):
///  monotonic id allocation skipping ids that are still pending, and atomic
///  consume-on-delivery.
struct CorrelationTable<T> {
    next_id: u32,
    pending: FxHashMap<u32, oneshot::Sender<T>>,
}

impl<T> CorrelationTable<T> {
    fn new() -> CorrelationTable<T> {
        CorrelationTable {
            next_id: 0,
            pending: FxHashMap::default(),
        }
    }

    fn allocate(&mut self) -> (u32, oneshot::Receiver<T>) {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&self.next_id) {
                break;
            }
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(self.next_id, tx);
        (self.next_id, rx)
    }

    fn consume(&mut self, id: u32) -> Option<oneshot::Sender<T>> {
        self.pending.remove(&id)
    }
}

/// Releases exactly the claimed outbound transaction slot, on every exit path.
struct SlotGuard<'a> {
    conn: &'a Connection,
    trans_id: u16,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.conn.send_slots.lock().unwrap()[self.trans_id as usize] = false;
    }
}

/// Per-peer state: transaction slots in both directions, the inbound message
///  queue, and the correlation tables for the inner request/response and ping
///  exchanges.
///
/// Every mutable field is guarded by its own lock, and no lock is held across
///  socket or channel operations.
pub struct Connection {
    pipeline: SendPipeline,
    peer_addr: SocketAddr,
    stream_id: u32,
    config: Arc<Config>,

    /// inbound transaction slots, indexed by transaction id
    recv_slots: Mutex<Vec<Option<Arc<ReceiveBuffer>>>>,
    /// occupancy of outbound transaction ids
    send_slots: Mutex<Vec<bool>>,
    /// transaction id -> completion signal, armed by `send_msg`, fired when
    ///  the peer's `Received` receipt arrives
    send_waiters: Mutex<FxHashMap<u16, oneshot::Sender<()>>>,

    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,

    requests: Mutex<CorrelationTable<Vec<u8>>>,
    pings: Mutex<CorrelationTable<()>>,

    last_active: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        pipeline: SendPipeline,
        peer_addr: SocketAddr,
        stream_id: u32,
        config: Arc<Config>,
    ) -> Connection {
        let (inbound_tx, inbound_rx) = mpsc::channel(1);

        Connection {
            pipeline,
            peer_addr,
            stream_id,
            config: config.clone(),
            recv_slots: Mutex::new(vec![None; config.trans_slots as usize]),
            send_slots: Mutex::new(vec![false; config.trans_slots as usize]),
            send_waiters: Mutex::new(FxHashMap::default()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            requests: Mutex::new(CorrelationTable::new()),
            pings: Mutex::new(CorrelationTable::new()),
            last_active: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pipeline.local_addr()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Cancel the shutdown signal: every blocking operation on this connection
    ///  returns `ConnectionShutdown`, and the pool reaps the connection on its
    ///  next pass.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap()
    }

    // ---- inbound dispatch ---------------------------------------------------

    /// Decode one datagram and dispatch on its segment type. Called by the
    ///  endpoint's read loop; errors are reported to it for logging, the
    ///  connection itself survives all of them.
    pub(crate) async fn handle(&self, datagram: &[u8]) -> Result<(), TransportError> {
        *self.last_active.lock().unwrap() = Instant::now();

        let segment = Segment::deser(datagram)?;
        trace!(
            "{}: received {:?} segment, trans {} order {}",
            self,
            segment.kind,
            segment.trans_id,
            segment.order_id
        );

        match segment.kind {
            SegmentKind::Syn => self.handle_syn(segment).await,
            SegmentKind::PingReq => self.handle_ping_req(segment).await,
            SegmentKind::PingRep => self.handle_ping_rep(segment),
            SegmentKind::Req => self.handle_req(segment).await,
            SegmentKind::Rep => self.handle_rep(segment),
            SegmentKind::Received => self.handle_received(segment),
            SegmentKind::Trans => self.handle_trans(segment).await,
            SegmentKind::ReTrans => {
                warn!("{}: ReTrans segments are reserved and unused", self);
                Ok(())
            }
            SegmentKind::Ack => {
                warn!("{}: unexpected Ack segment outside handshake", self);
                Ok(())
            }
        }
    }

    /// Server side of the handshake: echo the key back, stamped with the
    ///  stream id this connection was registered under.
    async fn handle_syn(&self, segment: Segment) -> Result<(), TransportError> {
        let ack = Segment::new(SegmentKind::Ack, 0, self.stream_id, 0, 0, segment.body)?;
        self.pipeline.send_segment(self.peer_addr, &ack).await?;
        Ok(())
    }

    async fn handle_ping_req(&self, segment: Segment) -> Result<(), TransportError> {
        let rep = Segment::new(SegmentKind::PingRep, 0, self.stream_id, 0, 0, segment.body)?;
        self.pipeline.send_segment(self.peer_addr, &rep).await?;
        Ok(())
    }

    fn handle_ping_rep(&self, segment: Segment) -> Result<(), TransportError> {
        if segment.body.len() < 4 {
            warn!("{}: ping reply without a ping id", self);
            return Ok(());
        }
        let ping_id = u32::from_be_bytes([
            segment.body[0],
            segment.body[1],
            segment.body[2],
            segment.body[3],
        ]);
        if let Some(tx) = self.pings.lock().unwrap().consume(ping_id) {
            tx.send(()).ok();
        }
        Ok(())
    }

    async fn handle_req(&self, segment: Segment) -> Result<(), TransportError> {
        let mut body: &[u8] = &segment.body;
        let header = match RequestHeader::deser(&mut body) {
            Ok(header) => header,
            Err(e) => {
                warn!("{}: invalid request body: {}", self, e);
                return Ok(());
            }
        };

        match header.kind {
            REQUEST_KIND_QUERY_RECEIVE => self.handle_query_receive(&segment, &header).await,
            other => {
                self.send_query_response(
                    header.request_id,
                    segment.trans_id,
                    &QueryReceiveResponse::UnknownType,
                )
                .await?;
                Err(TransportError::UnknownRequestType(other))
            }
        }
    }

    /// Answer with this endpoint's view of the queried transaction.
    async fn handle_query_receive(
        &self,
        segment: &Segment,
        header: &RequestHeader,
    ) -> Result<(), TransportError> {
        let buffer = self.recv_slot(segment.trans_id)?;

        let response = match buffer {
            None => QueryReceiveResponse::NotExist,
            Some(buffer) if buffer.is_completed() => QueryReceiveResponse::Completed,
            Some(buffer) => {
                let (largest_order_id, missing) = buffer.missing();
                QueryReceiveResponse::NotCompleted {
                    largest_order_id,
                    missing,
                }
            }
        };

        self.send_query_response(header.request_id, segment.trans_id, &response)
            .await
    }

    async fn send_query_response(
        &self,
        request_id: u32,
        trans_id: u16,
        response: &QueryReceiveResponse,
    ) -> Result<(), TransportError> {
        let mut body = BytesMut::new();
        body.extend_from_slice(&request_id.to_be_bytes());
        response.ser(&mut body);

        let rep = Segment::new(SegmentKind::Rep, 0, self.stream_id, trans_id, 0, body.to_vec())?;
        self.pipeline.send_segment(self.peer_addr, &rep).await?;
        Ok(())
    }

    fn handle_rep(&self, segment: Segment) -> Result<(), TransportError> {
        if segment.body.len() < 4 {
            warn!("{}: response without a request id", self);
            return Ok(());
        }
        let request_id = u32::from_be_bytes([
            segment.body[0],
            segment.body[1],
            segment.body[2],
            segment.body[3],
        ]);

        if let Some(tx) = self.requests.lock().unwrap().consume(request_id) {
            tx.send(segment.body[4..].to_vec()).ok();
        } else {
            debug!("{}: response for unknown request {}", self, request_id);
        }
        Ok(())
    }

    fn handle_received(&self, segment: Segment) -> Result<(), TransportError> {
        if let Some(tx) = self.send_waiters.lock().unwrap().remove(&segment.trans_id) {
            tx.send(()).ok();
        } else {
            debug!(
                "{}: receipt for transaction {} with no waiting sender",
                self, segment.trans_id
            );
        }
        Ok(())
    }

    async fn handle_trans(&self, segment: Segment) -> Result<(), TransportError> {
        let buffer = {
            let mut slots = self.recv_slots.lock().unwrap();
            let slot = slots
                .get_mut(segment.trans_id as usize)
                .ok_or(TransportError::TransIdOutOfRange(segment.trans_id))?;

            match slot {
                // a completed buffer means the peer started a new message on
                //  the same transaction id: replace it with a fresh one
                Some(buffer) if !buffer.is_completed() => buffer.clone(),
                _ => {
                    let buffer = Arc::new(ReceiveBuffer::new());
                    *slot = Some(buffer.clone());
                    buffer
                }
            }
        };

        if let Some(message) = buffer.save(&segment) {
            // enqueue for the application first, confirm second
            select! {
                result = self.inbound_tx.send(message) => {
                    if result.is_err() {
                        return Err(TransportError::ConnectionShutdown);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    return Err(TransportError::ConnectionShutdown);
                }
            }

            let receipt =
                Segment::new(SegmentKind::Received, 0, self.stream_id, segment.trans_id, 0, Vec::new())?;
            self.pipeline.send_segment(self.peer_addr, &receipt).await?;
        }
        Ok(())
    }

    fn recv_slot(&self, trans_id: u16) -> Result<Option<Arc<ReceiveBuffer>>, TransportError> {
        let slots = self.recv_slots.lock().unwrap();
        slots
            .get(trans_id as usize)
            .cloned()
            .ok_or(TransportError::TransIdOutOfRange(trans_id))
    }

    // ---- application surface ------------------------------------------------

    /// Receive the next fully reassembled message, blocking until one is
    ///  available or the connection shuts down.
    pub async fn recv_msg(&self) -> Result<Vec<u8>, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionShutdown);
        }
        let mut inbound = self.inbound_rx.lock().await;
        select! {
            message = inbound.recv() => message.ok_or(TransportError::ConnectionShutdown),
            _ = self.shutdown.cancelled() => Err(TransportError::ConnectionShutdown),
        }
    }

    /// Like [Self::recv_msg], giving up with `Timeout` after `timeout`.
    pub async fn recv_msg_timeout(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionShutdown);
        }
        let mut inbound = self.inbound_rx.lock().await;
        select! {
            message = inbound.recv() => message.ok_or(TransportError::ConnectionShutdown),
            _ = sleep(timeout) => Err(TransportError::Timeout),
            _ = self.shutdown.cancelled() => Err(TransportError::ConnectionShutdown),
        }
    }

    /// Send one message reliably: transmit all segments, then keep querying
    ///  the receiver for gaps and retransmitting until the `Received` receipt
    ///  arrives or the round budget is exhausted.
    pub async fn send_msg(&self, message: &[u8]) -> Result<(), TransportError> {
        if message.is_empty() {
            return Err(TransportError::EmptyMessage);
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(message.len()));
        }
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionShutdown);
        }

        let slot = self.claim_send_slot().await?;
        let sending = SendBuffer::new(self.stream_id, slot.trans_id, message);

        let mut done_rx = {
            let (tx, rx) = oneshot::channel();
            self.send_waiters.lock().unwrap().insert(slot.trans_id, tx);
            rx
        };

        let result = self.send_rounds(&sending, &mut done_rx).await;
        self.send_waiters.lock().unwrap().remove(&slot.trans_id);
        result
    }

    /// Scan for a free outbound transaction id; poll while all are taken.
    async fn claim_send_slot(&self) -> Result<SlotGuard<'_>, TransportError> {
        loop {
            {
                let mut slots = self.send_slots.lock().unwrap();
                if let Some(idx) = slots.iter().position(|taken| !taken) {
                    slots[idx] = true;
                    return Ok(SlotGuard {
                        conn: self,
                        trans_id: idx as u16,
                    });
                }
            }
            trace!("{}: sending list is full, waiting for a free transaction slot", self);
            select! {
                _ = sleep(self.config.slot_poll_interval) => {}
                _ = self.shutdown.cancelled() => return Err(TransportError::ConnectionShutdown),
            }
        }
    }

    async fn send_rounds(
        &self,
        sending: &SendBuffer,
        done_rx: &mut oneshot::Receiver<()>,
    ) -> Result<(), TransportError> {
        let segment_count = sending.segment_count();

        let mut round = 0;
        'rounds: while round < self.config.send_max_rounds {
            round += 1;
            let mut budget = self.config.send_window;

            if round == 1 {
                for segment in sending.iter_segments() {
                    if budget == 0 {
                        // window exhausted: wait for the receiver to drain
                        //  before querying what is left
                        break;
                    }
                    self.pipeline.send_segment(self.peer_addr, &segment).await?;
                    budget -= 1;
                }
            } else {
                match self.query_receive(sending.trans_id()).await? {
                    QueryReceiveResponse::Completed => return Ok(()),
                    QueryReceiveResponse::UnknownType => {
                        return Err(TransportError::UnknownRequestType(
                            REQUEST_KIND_QUERY_RECEIVE,
                        ));
                    }
                    QueryReceiveResponse::NotExist => {
                        // the peer has no reassembly state at all; start over
                        warn!(
                            "{}: peer has no state for transaction {}, retransmitting",
                            self,
                            sending.trans_id()
                        );
                        for segment in sending.iter_segments() {
                            if budget == 0 {
                                break;
                            }
                            self.pipeline.send_segment(self.peer_addr, &segment).await?;
                            budget -= 1;
                        }
                    }
                    QueryReceiveResponse::NotCompleted {
                        largest_order_id,
                        missing,
                    } => {
                        for order_id in missing {
                            if order_id >= segment_count {
                                error!(
                                    "{}: peer reported missing order id {} beyond segment count {}",
                                    self, order_id, segment_count
                                );
                                continue;
                            }
                            if budget == 0 {
                                continue 'rounds;
                            }
                            self.pipeline
                                .send_segment(self.peer_addr, &sending.segment(order_id))
                                .await?;
                            budget -= 1;
                        }
                        // everything beyond the receiver's horizon was never
                        //  seen, missing list or not
                        for order_id in largest_order_id.saturating_add(1)..segment_count {
                            if budget == 0 {
                                continue 'rounds;
                            }
                            self.pipeline
                                .send_segment(self.peer_addr, &sending.segment(order_id))
                                .await?;
                            budget -= 1;
                        }
                    }
                }
            }

            select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(TransportError::ConnectionShutdown),
                result = &mut *done_rx => {
                    return result.map_err(|_| TransportError::ConnectionShutdown);
                }
                _ = sleep(self.config.sending_timeout) => {}
            }
        }

        Err(TransportError::Timeout)
    }

    /// Ask the peer which order ids of `trans_id` are still outstanding.
    ///  Retries on a per-attempt timer, bounded by an overall deadline.
    async fn query_receive(&self, trans_id: u16) -> Result<QueryReceiveResponse, TransportError> {
        let (request_id, mut rx) = self.requests.lock().unwrap().allocate();

        let mut body = BytesMut::new();
        RequestHeader {
            request_id,
            kind: REQUEST_KIND_QUERY_RECEIVE,
        }
        .ser(&mut body);
        let request = Segment::new(SegmentKind::Req, 0, self.stream_id, trans_id, 0, body.to_vec())?;

        let deadline = tokio::time::Instant::now() + self.config.request_timeout;

        for _ in 0..self.config.request_max_attempts {
            if let Err(e) = self.pipeline.send_segment(self.peer_addr, &request).await {
                self.requests.lock().unwrap().consume(request_id);
                return Err(e.into());
            }

            select! {
                result = &mut rx => {
                    return match result {
                        Ok(response_body) => {
                            let mut buf: &[u8] = &response_body;
                            QueryReceiveResponse::deser(&mut buf).map_err(|e| {
                                error!("{}: malformed query-receive response: {}", self, e);
                                TransportError::Timeout
                            })
                        }
                        Err(_) => Err(TransportError::ConnectionShutdown),
                    };
                }
                _ = sleep(self.config.request_attempt_timeout) => {
                    trace!("{}: query-receive attempt timed out, retrying", self);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.requests.lock().unwrap().consume(request_id);
                    return Err(TransportError::Timeout);
                }
                _ = self.shutdown.cancelled() => {
                    self.requests.lock().unwrap().consume(request_id);
                    return Err(TransportError::ConnectionShutdown);
                }
            }
        }

        self.requests.lock().unwrap().consume(request_id);
        Err(TransportError::Timeout)
    }

    /// Measure the round-trip time to the peer.
    pub async fn ping(&self) -> Result<Duration, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionShutdown);
        }
        let (ping_id, rx) = self.pings.lock().unwrap().allocate();

        let request = Segment::new(
            SegmentKind::PingReq,
            0,
            self.stream_id,
            0,
            0,
            ping_id.to_be_bytes().to_vec(),
        )?;
        if let Err(e) = self.pipeline.send_segment(self.peer_addr, &request).await {
            self.pings.lock().unwrap().consume(ping_id);
            return Err(e.into());
        }

        let start = Instant::now();
        select! {
            result = rx => match result {
                Ok(()) => Ok(start.elapsed()),
                Err(_) => Err(TransportError::ConnectionShutdown),
            },
            _ = sleep(self.config.ping_timeout) => {
                self.pings.lock().unwrap().consume(ping_id);
                Err(TransportError::Timeout)
            }
            _ = self.shutdown.cancelled() => {
                self.pings.lock().unwrap().consume(ping_id);
                Err(TransportError::ConnectionShutdown)
            }
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conn {}: {}(L) -- {}(R)",
            self.stream_id,
            self.local_addr(),
            self.peer_addr
        )
    }
}
