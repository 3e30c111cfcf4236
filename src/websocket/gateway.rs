//! WebSocket gateway for browser listeners
//!
//! Listens on its own port (primary port + 1 by default) but shares the
//! server's reactor. Any path upgrades; a session receives one JSON format
//! message and then raw PCM as binary frames. A bounded per-session queue
//! keeps slow browsers from holding memory or other listeners hostage.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use crossbeam_channel::bounded;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::broadcast::AudioSink;
use crate::constants::{WS_HEARTBEAT_INTERVAL, WS_HEARTBEAT_TIMEOUT, WS_MAX_QUEUE, WS_SEND_IDLE};
use crate::error::{Error, NetworkError, Result};
use crate::network::session::AtomicInstant;
use crate::protocol::AudioFormat;

/// One connected browser
struct WsSession {
    id: u64,
    outbound: Mutex<VecDeque<Message>>,
    last_tick: AtomicInstant,
    closed: watch::Sender<bool>,
}

impl WsSession {
    fn new(id: u64) -> (Arc<Self>, watch::Receiver<bool>) {
        let (closed, closed_rx) = watch::channel(false);
        let last_tick = AtomicInstant::now();
        last_tick.touch();
        (
            Arc::new(Self {
                id,
                outbound: Mutex::new(VecDeque::new()),
                last_tick,
                closed,
            }),
            closed_rx,
        )
    }

    /// Queue an audio frame unless the session is saturated
    fn enqueue_audio(&self, data: Vec<u8>) -> bool {
        let mut outbound = self.outbound.lock().unwrap();
        let audio_queued = outbound
            .iter()
            .filter(|msg| matches!(msg, Message::Binary(_)))
            .count();
        if audio_queued >= WS_MAX_QUEUE {
            return false;
        }
        outbound.push_back(Message::Binary(data.into()));
        true
    }

    /// Control frames (pong) bypass the audio bound
    fn enqueue_control(&self, msg: Message) {
        self.outbound.lock().unwrap().push_back(msg);
    }

    fn pop(&self) -> Option<Message> {
        self.outbound.lock().unwrap().pop_front()
    }

    fn close(&self) {
        let _ = self.closed.send(true);
    }
}

/// WebSocket server mirroring the primary audio stream to browsers
pub struct WsGateway {
    sessions: Mutex<HashMap<u64, Arc<WsSession>>>,
    next_session_id: AtomicU64,
    running: AtomicBool,
    format: Mutex<Option<AudioFormat>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WsGateway {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            format: Mutex::new(None),
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Start serving on `host:port`, spawning onto the shared reactor
    pub fn start_server(
        self: &Arc<Self>,
        handle: &Handle,
        host: &str,
        port: u16,
        format: AudioFormat,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyRunning.into());
        }
        let bind_addr: IpAddr = match host.parse() {
            Ok(addr) => addr,
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::Config(format!("Invalid bind address: '{host}'")));
            }
        };
        *self.format.lock().unwrap() = Some(format);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = bounded(1);
        let gateway = self.clone();
        handle.spawn(async move {
            let listener = match tokio::net::TcpListener::bind(SocketAddr::new(bind_addr, port))
                .await
            {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(listener.local_addr());

            let app = Router::new()
                .route("/audio", get(upgrade_handler))
                .fallback(upgrade_handler)
                .with_state(gateway.clone());
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                warn!("websocket server error: {e}");
            }
            gateway.running.store(false, Ordering::SeqCst);
            info!("websocket server stopped");
        });

        let local_addr = match ready_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(NetworkError::BindFailed(format!("{host}:{port}: {e}")).into());
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(NetworkError::BindFailed(format!("{host}:{port}")).into());
            }
        };
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *self.local_addr.lock().unwrap() = Some(local_addr);
        info!("websocket listen success on ws://{local_addr}");
        Ok(())
    }

    /// Close every session with "going away" and stop accepting.
    /// Safe to call more than once.
    pub fn stop_server(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.close();
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        *self.local_addr.lock().unwrap() = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    async fn run_session(self: Arc<Self>, socket: WebSocket) {
        let format = *self.format.lock().unwrap();
        let Some(format) = format else {
            return;
        };

        let (mut sink, mut stream) = socket.split();
        // the format message always comes first
        if sink
            .send(Message::Text(format.to_json().into()))
            .await
            .is_err()
        {
            return;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (session, closed_rx) = WsSession::new(id);
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(id, session.clone());
            info!("websocket session {} connected, total: {}", id, sessions.len());
        }

        let send_task = tokio::spawn(send_loop(session.clone(), sink, closed_rx.clone()));
        let heartbeat_task = tokio::spawn(heartbeat_loop(session.clone(), closed_rx.clone()));

        let mut closed_rx = closed_rx;
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = closed_rx.changed() => break,
            };
            let Some(msg) = msg else { break };
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("websocket session {id} read error: {e}");
                    break;
                }
            };
            session.last_tick.touch();
            match msg {
                Message::Text(text) if text.as_str() == "ping" => {
                    session.enqueue_control(Message::Text("pong".into()));
                }
                Message::Close(_) => {
                    debug!("websocket session {id} closed by client");
                    break;
                }
                _ => {}
            }
        }

        session.close();
        let _ = send_task.await;
        let _ = heartbeat_task.await;
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&id);
        info!("websocket session {} ended, total: {}", id, sessions.len());
    }
}

impl Default for WsGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for WsGateway {
    /// Enqueue the chunk for every session; a saturated session loses this
    /// frame and nothing else
    fn broadcast_audio_data(&self, data: &[u8], _block_align: usize) {
        if data.is_empty() || !self.running.load(Ordering::Relaxed) {
            return;
        }
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            if !session.enqueue_audio(data.to_vec()) {
                trace!("websocket session {} queue full, dropping frame", session.id);
            }
        }
    }
}

async fn upgrade_handler(
    State(gateway): State<Arc<WsGateway>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| gateway.run_session(socket))
}

/// Writes queued frames one at a time; naps briefly when the queue is dry
async fn send_loop(
    session: Arc<WsSession>,
    mut sink: SplitSink<WebSocket, Message>,
    closed_rx: watch::Receiver<bool>,
) {
    loop {
        if *closed_rx.borrow() {
            let frame = CloseFrame {
                code: close_code::AWAY,
                reason: "going away".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            break;
        }
        match session.pop() {
            Some(msg) => {
                if sink.send(msg).await.is_err() {
                    session.close();
                    break;
                }
            }
            None => tokio::time::sleep(WS_SEND_IDLE).await,
        }
    }
}

/// Closes the session when the browser stays silent past the timeout
async fn heartbeat_loop(session: Arc<WsSession>, mut closed_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(WS_HEARTBEAT_INTERVAL) => {}
            _ = closed_rx.changed() => break,
        }
        if session.last_tick.elapsed() > WS_HEARTBEAT_TIMEOUT {
            info!("websocket session {} heartbeat timeout", session.id);
            session.close();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_queue_saturates_at_bound() {
        let (session, _closed_rx) = WsSession::new(1);

        let mut accepted = 0;
        for _ in 0..100 {
            if session.enqueue_audio(vec![0u8; 1440]) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, WS_MAX_QUEUE);
        assert_eq!(session.outbound.lock().unwrap().len(), WS_MAX_QUEUE);
    }

    #[test]
    fn test_queue_drains_and_accepts_again() {
        let (session, _closed_rx) = WsSession::new(1);

        for _ in 0..WS_MAX_QUEUE {
            assert!(session.enqueue_audio(vec![1, 2, 3]));
        }
        assert!(!session.enqueue_audio(vec![4, 5, 6]));

        assert!(session.pop().is_some());
        assert!(session.enqueue_audio(vec![7, 8, 9]));
    }

    #[test]
    fn test_control_frames_bypass_audio_bound() {
        let (session, _closed_rx) = WsSession::new(1);

        for _ in 0..WS_MAX_QUEUE {
            session.enqueue_audio(vec![0u8; 4]);
        }
        session.enqueue_control(Message::Text("pong".into()));
        assert_eq!(session.outbound.lock().unwrap().len(), WS_MAX_QUEUE + 1);

        // audio is still rejected while the queue is saturated
        assert!(!session.enqueue_audio(vec![0u8; 4]));
    }

    #[test]
    fn test_close_signal_latches() {
        let (session, closed_rx) = WsSession::new(1);
        assert!(!*closed_rx.borrow());
        session.close();
        assert!(*closed_rx.borrow());
    }
}
