//! Configuration transport.
//!
//! Carries newline-terminated JSON over an abstract byte link: outbound
//! responses and notifications are fragmented and paced ([`crate::frag`]),
//! inbound chunks are reassembled into complete command messages and pushed
//! into a small bounded queue for the command handler. A single
//! transmission mutex serializes outgoing payloads; an active-transmission
//! counter lets shutdown (and large-response staging) wait for the wire to
//! drain.
//!
//! The physical link is pluggable: a framed TCP listener stands in for the
//! wireless GATT server in production, and an in-memory duplex drives the
//! protocol in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldgate_core::StreamGate;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::frag::{check_response_size, fragment, plan_fragments, Reassembler};
use crate::metrics::LinkMetrics;
use crate::mtu::{MtuAction, MtuNegotiator, MtuState};

/// Capacity of the completed-message queue feeding the command handler.
pub const INBOUND_QUEUE_DEPTH: usize = 8;

/// Link-layer events surfaced by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A client attached to the link.
    Connected,
    /// Raw bytes from the client.
    Chunk(Vec<u8>),
    /// The client went away.
    Disconnected,
}

/// A physical (or simulated) byte link.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Transmit one outbound fragment.
    async fn send_fragment(&self, bytes: &[u8]) -> Result<()>;

    /// Next link event; `None` when the binding shut down.
    async fn next_event(&self) -> Option<LinkEvent>;
}

/// The protocol layer over a [`LinkTransport`].
pub struct ConfigTransport {
    link: Arc<dyn LinkTransport>,
    tx_mutex: Mutex<()>,
    active_transmissions: AtomicUsize,
    negotiator: Mutex<MtuNegotiator>,
    negotiated_mtu: RwLock<Option<u16>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    stream_gate: StreamGate,
    metrics: Arc<LinkMetrics>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl ConfigTransport {
    /// Build the transport. The returned receiver yields complete inbound
    /// command messages.
    pub fn new(
        link: Arc<dyn LinkTransport>,
        stream_gate: StreamGate,
        metrics: Arc<LinkMetrics>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let transport = Arc::new(Self {
            link,
            tx_mutex: Mutex::new(()),
            active_transmissions: AtomicUsize::new(0),
            negotiator: Mutex::new(MtuNegotiator::new()),
            negotiated_mtu: RwLock::new(None),
            inbound_tx,
            stream_gate,
            metrics,
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        });
        (transport, inbound_rx)
    }

    /// Currently negotiated MTU, if negotiation completed or fell back.
    pub async fn negotiated_mtu(&self) -> Option<u16> {
        *self.negotiated_mtu.read().await
    }

    pub async fn mtu_state(&self) -> MtuState {
        self.negotiator.lock().await.state()
    }

    /// Outstanding outbound payloads.
    pub fn active_transmissions(&self) -> usize {
        self.active_transmissions.load(Ordering::SeqCst)
    }

    /// Wait until no transmission is in flight, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_transmissions() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Send one response or notification. The payload is terminated,
    /// fragmented under the transmission mutex, and paced per the plan.
    pub async fn send_message(&self, payload: &[u8]) -> Result<()> {
        check_response_size(payload.len())?;

        let mtu = *self.negotiated_mtu.read().await;
        let plan = plan_fragments(payload.len(), mtu);

        let mut framed = Vec::with_capacity(payload.len() + 1);
        framed.extend_from_slice(payload);
        framed.push(b'\n');

        self.active_transmissions.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = async {
            let _guard = self.tx_mutex.lock().await;
            let fragments = fragment(&framed, &plan);
            let count = fragments.len();
            for (index, chunk) in fragments.into_iter().enumerate() {
                self.link.send_fragment(chunk).await?;
                if index + 1 < count {
                    tokio::time::sleep(Duration::from_millis(plan.delay_ms)).await;
                }
            }
            Ok::<(), LinkError>(())
        }
        .await;
        self.active_transmissions.fetch_sub(1, Ordering::SeqCst);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.record(
            elapsed_ms,
            result.is_ok(),
            None,
            mtu,
            framed.len() as u64,
        );
        if let Err(ref e) = result {
            warn!(bytes = framed.len(), "outbound message failed: {}", e);
        } else {
            debug!(bytes = framed.len(), chunk = plan.chunk_size, "message sent");
        }
        result
    }

    /// Serialize and send a JSON document.
    pub async fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        self.send_message(value.to_string().as_bytes()).await
    }

    async fn send_mtu_request(&self) {
        let request = serde_json::json!({"type": "mtu_request", "mtu": crate::mtu::MTU_REQUEST});
        let mut framed = request.to_string().into_bytes();
        framed.push(b'\n');
        if let Err(e) = self.link.send_fragment(&framed).await {
            warn!("MTU request send failed: {}", e);
        }
    }

    /// Start the session task: pumps link events, drives MTU negotiation,
    /// reassembles inbound commands.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let transport = self.clone();
        let running_flag = self.running.clone();

        let handle = tokio::spawn(async move {
            let epoch = Instant::now();
            let mut reassembler = Reassembler::new();
            loop {
                if !*running_flag.read().await {
                    break;
                }
                let event = match tokio::time::timeout(
                    Duration::from_secs(1),
                    transport.link.next_event(),
                )
                .await
                {
                    Err(_) => {
                        // Idle second: drive the MTU timer.
                        let now_ms = epoch.elapsed().as_millis() as u64;
                        let action = transport.negotiator.lock().await.on_tick(now_ms);
                        match action {
                            Some(MtuAction::Retry) => transport.send_mtu_request().await,
                            Some(MtuAction::UseFallback) => {
                                let fallback = transport.negotiator.lock().await.mtu();
                                *transport.negotiated_mtu.write().await = Some(fallback);
                            }
                            None => {}
                        }
                        continue;
                    }
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                };

                match event {
                    LinkEvent::Connected => {
                        info!("configuration link client connected");
                        reassembler.reset();
                        let now_ms = epoch.elapsed().as_millis() as u64;
                        transport.negotiator.lock().await.on_connect(now_ms);
                        *transport.negotiated_mtu.write().await = None;
                        transport.send_mtu_request().await;
                    }
                    LinkEvent::Disconnected => {
                        info!("configuration link client disconnected");
                        reassembler.reset();
                        transport.negotiator.lock().await.reset();
                        *transport.negotiated_mtu.write().await = None;
                        // No further stream notifications for a dead link.
                        transport.stream_gate.stop();
                    }
                    LinkEvent::Chunk(chunk) => {
                        let messages = match reassembler.feed(&chunk) {
                            Ok(messages) => messages,
                            Err(e) => {
                                warn!("inbound reassembly failed: {}", e);
                                continue;
                            }
                        };
                        for message in messages {
                            if transport.intercept_control(&message).await {
                                continue;
                            }
                            // Bounded queue: waiting here is the inbound
                            // back-pressure.
                            if transport.inbound_tx.send(message).await.is_err() {
                                warn!("command queue closed; dropping message");
                            }
                        }
                    }
                }
            }
            debug!("configuration transport task exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!("configuration transport started");
    }

    /// Handle protocol control frames. Returns `true` when consumed.
    async fn intercept_control(&self, message: &[u8]) -> bool {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(message) else {
            return false;
        };
        if value.get("type").and_then(|t| t.as_str()) == Some("mtu_response") {
            if let Some(client_mtu) = value.get("mtu").and_then(|m| m.as_u64()) {
                let negotiated = self
                    .negotiator
                    .lock()
                    .await
                    .on_response(client_mtu.min(u16::MAX as u64) as u16);
                *self.negotiated_mtu.write().await = Some(negotiated);
            }
            return true;
        }
        false
    }

    /// Stop the session task.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("configuration transport stopped");
    }
}

// ---- in-memory binding (tests and loopback) ----

/// In-memory duplex link: the server half implements [`LinkTransport`],
/// the client half injects events and observes outbound fragments.
pub struct MemoryLink {
    events: Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test-side handle of a [`MemoryLink`].
pub struct MemoryClient {
    pub event_tx: mpsc::UnboundedSender<LinkEvent>,
    pub out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryLink {
    pub fn pair() -> (Arc<Self>, MemoryClient) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: Mutex::new(event_rx),
                out_tx,
            }),
            MemoryClient { event_tx, out_rx },
        )
    }
}

#[async_trait]
impl LinkTransport for MemoryLink {
    async fn send_fragment(&self, bytes: &[u8]) -> Result<()> {
        self.out_tx
            .send(bytes.to_vec())
            .map_err(|_| LinkError::Closed)
    }

    async fn next_event(&self) -> Option<LinkEvent> {
        self.events.lock().await.recv().await
    }
}

// ---- TCP binding ----

/// Framed TCP listener standing in for the wireless GATT server. One
/// client at a time; a newer connection replaces the previous one.
pub struct TcpLink {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    events: Mutex<mpsc::Receiver<LinkEvent>>,
    accept_task: JoinHandle<()>,
}

impl TcpLink {
    /// Bind the listener and start accepting.
    pub async fn bind(addr: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LinkError::Send(format!("bind {}: {}", addr, e)))?;
        info!(addr = %addr, "configuration link listening");

        let writer: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));
        let (event_tx, event_rx) = mpsc::channel(64);

        let writer_slot = writer.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                info!(peer = %peer, "link client accepted");
                let (mut read_half, write_half) = socket.into_split();
                *writer_slot.lock().await = Some(write_half);
                if event_tx.send(LinkEvent::Connected).await.is_err() {
                    break;
                }

                let mut buf = vec![0u8; 4096];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if event_tx
                                .send(LinkEvent::Chunk(buf[..n].to_vec()))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                *writer_slot.lock().await = None;
                if event_tx.send(LinkEvent::Disconnected).await.is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            writer,
            events: Mutex::new(event_rx),
            accept_task,
        }))
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl LinkTransport for TcpLink {
    async fn send_fragment(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w
                .write_all(bytes)
                .await
                .map_err(|e| LinkError::Send(e.to_string())),
            None => Err(LinkError::Closed),
        }
    }

    async fn next_event(&self) -> Option<LinkEvent> {
        self.events.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_fixture() -> (Arc<ConfigTransport>, MemoryClient, mpsc::Receiver<Vec<u8>>) {
        let (link, client) = MemoryLink::pair();
        let metrics = Arc::new(LinkMetrics::new());
        let (transport, inbound) = ConfigTransport::new(link, StreamGate::new(), metrics);
        (transport, client, inbound)
    }

    /// Collect outbound fragments until a full line (terminator) arrived.
    async fn read_message(client: &mut MemoryClient) -> Vec<u8> {
        let mut collected = Vec::new();
        while !collected.contains(&b'\n') {
            let chunk = client.out_rx.recv().await.expect("fragment");
            collected.extend_from_slice(&chunk);
        }
        collected.pop();
        collected
    }

    #[tokio::test]
    async fn test_send_reassembles_to_original() {
        let (transport, mut client, _inbound) = transport_fixture();
        let payload = serde_json::json!({"status": "ok", "data": "x".repeat(1000)});
        transport.send_json(&payload).await.unwrap();

        let wire = read_message(&mut client).await;
        let parsed: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(parsed["status"], "ok");
    }

    #[tokio::test]
    async fn test_oversize_response_rejected() {
        let (transport, _client, _inbound) = transport_fixture();
        let big = vec![b'x'; crate::frag::MAX_RESPONSE_SIZE_BYTES + 1];
        assert!(matches!(
            transport.send_message(&big).await,
            Err(LinkError::FragOversize(_, _))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_at_cap_succeeds() {
        let (transport, mut client, _inbound) = transport_fixture();
        let payload = vec![b'y'; crate::frag::MAX_RESPONSE_SIZE_BYTES];
        let send = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send_message(&payload).await })
        };
        // Drain fragments so the sender is not blocked on an unbounded
        // channel (it is unbounded, but collect anyway to verify length).
        let mut collected = Vec::new();
        while !collected.contains(&b'\n') {
            let chunk = client.out_rx.recv().await.unwrap();
            collected.extend_from_slice(&chunk);
        }
        send.await.unwrap().unwrap();
        assert_eq!(collected.len(), crate::frag::MAX_RESPONSE_SIZE_BYTES + 1);
    }

    #[tokio::test]
    async fn test_inbound_command_and_mtu_flow() {
        let (transport, mut client, mut inbound) = transport_fixture();
        transport.start().await;

        client.event_tx.send(LinkEvent::Connected).unwrap();
        // The transport requests an MTU.
        let request = read_message(&mut client).await;
        let parsed: serde_json::Value = serde_json::from_slice(&request).unwrap();
        assert_eq!(parsed["type"], "mtu_request");
        assert_eq!(parsed["mtu"], 517);

        // Client answers, then sends a command split across chunks.
        client
            .event_tx
            .send(LinkEvent::Chunk(b"{\"type\":\"mtu_response\",\"mtu\":247}\n".to_vec()))
            .unwrap();
        client
            .event_tx
            .send(LinkEvent::Chunk(b"{\"op\":\"read\",".to_vec()))
            .unwrap();
        client
            .event_tx
            .send(LinkEvent::Chunk(b"\"type\":\"status\"}\n".to_vec()))
            .unwrap();

        let message = inbound.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&message).unwrap();
        assert_eq!(parsed["op"], "read");
        assert_eq!(transport.negotiated_mtu().await, Some(247));

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_stops_streaming() {
        let (link, client) = MemoryLink::pair();
        let gate = StreamGate::new();
        gate.start("A3F2C1");
        let metrics = Arc::new(LinkMetrics::new());
        let (transport, _inbound) = ConfigTransport::new(link, gate.clone(), metrics);
        transport.start().await;

        client.event_tx.send(LinkEvent::Disconnected).unwrap();
        // Give the session task a moment to process.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gate.active().is_none());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_transmissions_serialized() {
        let (transport, mut client, _inbound) = transport_fixture();
        let a = {
            let t = transport.clone();
            tokio::spawn(async move { t.send_message(&vec![b'a'; 600]).await })
        };
        let b = {
            let t = transport.clone();
            tokio::spawn(async move { t.send_message(&vec![b'b'; 600]).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // All fragments of one message come out contiguously.
        let mut wire = Vec::new();
        while let Ok(chunk) = client.out_rx.try_recv() {
            wire.extend_from_slice(&chunk);
        }
        let lines: Vec<&[u8]> = wire.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert!(line.iter().all(|&b| b == line[0]));
        }
    }
}
