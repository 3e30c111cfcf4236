//! TCP control plane and UDP fan-out
//!
//! One [`StreamServer`] owns the reactor, the listener sockets and the peer
//! registry. Each accepted control connection runs three tasks on the
//! reactor: a read loop, a writer draining a frame queue (so every reply is
//! a single write with no interleaving), and - once the listener starts
//! playing - a heartbeat loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::bounded;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::audio::pool::BufferPool;
use crate::audio::CaptureSource;
use crate::broadcast::{AudioSink, CompositeBroadcaster};
use crate::config::CaptureConfig;
use crate::constants::{
    HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MAX_UDP_PAYLOAD, POOL_INITIAL_CAPACITY, POOL_MAX_SIZE,
};
use crate::error::{Error, NetworkError, Result};
use crate::network::fanout::segment_chunk;
use crate::network::reactor::Reactor;
use crate::network::session::PeerRegistry;
use crate::protocol::{self, AudioFormat, Command};

/// The streaming server's control plane and datagram dispatcher
pub struct StreamServer {
    shared: Arc<ServerShared>,
    capture: Arc<dyn CaptureSource>,
    reactor: Mutex<Option<Arc<Reactor>>>,
}

struct ServerShared {
    registry: PeerRegistry,
    broadcasters: CompositeBroadcaster,
    pool: BufferPool,
    running: AtomicBool,
    next_conn_id: AtomicU64,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    udp_is_v4: AtomicBool,
    handle: Mutex<Option<Handle>>,
    format: Mutex<Option<AudioFormat>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl StreamServer {
    pub fn new(capture: Arc<dyn CaptureSource>) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                registry: PeerRegistry::new(),
                broadcasters: CompositeBroadcaster::new(),
                pool: BufferPool::new(MAX_UDP_PAYLOAD, POOL_INITIAL_CAPACITY, POOL_MAX_SIZE),
                running: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
                udp: Mutex::new(None),
                udp_is_v4: AtomicBool::new(true),
                handle: Mutex::new(None),
                format: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
            capture,
            reactor: Mutex::new(None),
        }
    }

    /// Bind both transports on `host:port`, start the capture with this
    /// server installed as its sink, and begin accepting listeners.
    ///
    /// Port 0 picks an ephemeral port; the UDP socket then binds whatever
    /// port the TCP listener was assigned.
    pub fn start_server(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        capture_config: &CaptureConfig,
    ) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyRunning.into());
        }
        if let Err(e) = capture_config.validate() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        let bind_addr: IpAddr = match host.parse() {
            Ok(addr) => addr,
            Err(_) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(Error::Config(format!("Invalid bind address: '{host}'")));
            }
        };

        let reactor = match Reactor::start("net-reactor") {
            Ok(reactor) => Arc::new(reactor),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let handle = reactor.handle().clone();

        // sockets must be created inside the runtime; hand the result back
        let (ready_tx, ready_rx) = bounded(1);
        handle.spawn(async move {
            let _ = ready_tx.send(bind_transports(bind_addr, port).await);
        });
        let (listener, udp) = match ready_rx.recv() {
            Ok(Ok(bound)) => bound,
            Ok(Err(e)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(NetworkError::BindFailed(format!("{host}:{port}: {e}")).into());
            }
            Err(_) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(NetworkError::BindFailed(format!("{host}:{port}")).into());
            }
        };

        let local_addr = listener.local_addr().map_err(|e| {
            self.shared.running.store(false, Ordering::SeqCst);
            Error::from(NetworkError::BindFailed(e.to_string()))
        })?;
        info!("tcp listen success on {local_addr}");
        info!("udp listen success on {local_addr}");

        let udp = Arc::new(udp);
        *self.shared.udp.lock().unwrap() = Some(udp.clone());
        self.shared
            .udp_is_v4
            .store(local_addr.is_ipv4(), Ordering::SeqCst);
        *self.shared.handle.lock().unwrap() = Some(handle.clone());
        *self.shared.local_addr.lock().unwrap() = Some(local_addr);

        let sink: Arc<dyn AudioSink> = self.clone();
        let format = match self.capture.start(sink, capture_config) {
            Ok(format) => format,
            Err(e) => {
                self.cleanup_after_failed_start(reactor);
                return Err(e);
            }
        };
        *self.shared.format.lock().unwrap() = Some(format);

        handle.spawn(accept_loop(self.shared.clone(), listener));
        handle.spawn(udp_register_loop(self.shared.clone(), udp));

        *self.reactor.lock().unwrap() = Some(reactor);
        info!("server started");
        Ok(())
    }

    /// Stop the capture, drop every peer, and join the reactor.
    /// Safe to call more than once.
    pub fn stop_server(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.capture.stop();
        let reactor = self.reactor.lock().unwrap().take();
        if let Some(reactor) = reactor {
            reactor.stop();
        }
        self.shared.registry.clear();
        *self.shared.udp.lock().unwrap() = None;
        *self.shared.handle.lock().unwrap() = None;
        *self.shared.local_addr.lock().unwrap() = None;
        info!("server stopped");
    }

    /// Block until the reactor exits (it never does on its own; another
    /// thread calls [`StreamServer::stop_server`])
    pub fn wait(&self) {
        let reactor = self.reactor.lock().unwrap().clone();
        if let Some(reactor) = reactor {
            reactor.wait();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Address both transports are bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// The negotiated stream format, once capture has started
    pub fn format(&self) -> Option<AudioFormat> {
        *self.shared.format.lock().unwrap()
    }

    /// Handle of the reactor runtime, for components sharing it
    pub fn runtime_handle(&self) -> Option<Handle> {
        self.shared.handle.lock().unwrap().clone()
    }

    /// Register a sink that receives every broadcast chunk alongside the
    /// UDP fan-out (the WebSocket gateway)
    pub fn add_broadcaster(&self, broadcaster: Arc<dyn AudioSink>) {
        self.shared.broadcasters.add(broadcaster);
        info!(
            "added broadcaster, total: {}",
            self.shared.broadcasters.len()
        );
    }

    fn cleanup_after_failed_start(&self, reactor: Arc<Reactor>) {
        reactor.stop();
        self.shared.running.store(false, Ordering::SeqCst);
        *self.shared.udp.lock().unwrap() = None;
        *self.shared.handle.lock().unwrap() = None;
        *self.shared.local_addr.lock().unwrap() = None;
    }
}

impl AudioSink for StreamServer {
    /// Fan a captured PCM chunk out to every transport. Called from the
    /// capture thread; only the memcpy into pool buffers happens here, the
    /// socket writes run on the reactor.
    fn broadcast_audio_data(&self, data: &[u8], block_align: usize) {
        let shared = &self.shared;
        if data.is_empty() || !shared.running.load(Ordering::Relaxed) {
            return;
        }

        // additional broadcasters first (the WebSocket gateway)
        shared.broadcasters.broadcast_audio_data(data, block_align);

        let endpoints = shared
            .registry
            .endpoints_for(shared.udp_is_v4.load(Ordering::Relaxed));
        if endpoints.is_empty() {
            return;
        }
        let segments = segment_chunk(data, block_align, &shared.pool);
        if segments.is_empty() {
            return;
        }

        let udp = shared.udp.lock().unwrap().clone();
        let handle = shared.handle.lock().unwrap().clone();
        let (Some(udp), Some(handle)) = (udp, handle) else {
            return;
        };

        // one job per broadcast call keeps intra-call segment order
        handle.spawn(async move {
            for segment in &segments {
                for endpoint in &endpoints {
                    if let Err(e) = udp.send_to(segment.as_slice(), *endpoint).await {
                        trace!("udp send to {endpoint} failed: {e}");
                    }
                }
            }
        });
    }
}

async fn bind_transports(host: IpAddr, port: u16) -> std::io::Result<(TcpListener, UdpSocket)> {
    let tcp_addr = SocketAddr::new(host, port);
    let socket = Socket::new(Domain::for_address(tcp_addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&tcp_addr.into())?;
    socket.listen(128)?;
    let listener = TcpListener::from_std(socket.into())?;

    // same port for both transports
    let udp_addr = SocketAddr::new(host, listener.local_addr()?.port());
    let socket = Socket::new(Domain::for_address(udp_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_send_buffer_size(1024 * 1024);
    socket.bind(&udp_addr.into())?;
    let udp = UdpSocket::from_std(socket.into())?;

    Ok((listener, udp))
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                break;
            }
        };
        info!("accept tcp://{addr}");
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay for {addr} failed: {e}");
        }
        let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(connection_task(shared.clone(), conn_id, stream, addr));
    }
}

async fn connection_task(
    shared: Arc<ServerShared>,
    conn_id: u64,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, close_rx) = watch::channel(false);
    let close_tx = Arc::new(close_tx);

    let writer = tokio::spawn(write_loop(
        write_half,
        frame_rx,
        close_tx.clone(),
        close_rx.clone(),
    ));

    read_loop(
        &shared,
        conn_id,
        read_half,
        addr,
        &frame_tx,
        &close_tx,
        close_rx,
    )
    .await;

    // remove the peer before the connection finishes shutting down
    shared.registry.remove(conn_id);
    let _ = close_tx.send(true);
    drop(frame_tx);
    let _ = writer.await;
    info!("close tcp://{addr}");
}

/// Drains the frame queue into the socket. Frames arrive fully assembled,
/// so each one is a single vectored write and replies never interleave.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    close_tx: Arc<watch::Sender<bool>>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_half.write_all(&frame).await {
                    trace!("write failed: {e}");
                    let _ = close_tx.send(true);
                    break;
                }
            }
            _ = close_rx.changed() => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

async fn read_loop(
    shared: &Arc<ServerShared>,
    conn_id: u64,
    mut read_half: OwnedReadHalf,
    addr: SocketAddr,
    frame_tx: &mpsc::UnboundedSender<Vec<u8>>,
    close_tx: &Arc<watch::Sender<bool>>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let raw = tokio::select! {
            read = read_half.read_u32_le() => match read {
                Ok(raw) => raw,
                Err(e) => {
                    trace!("read from tcp://{addr} failed: {e}");
                    break;
                }
            },
            _ = close_rx.changed() => break,
        };
        trace!("cmd {raw}");

        match Command::from_u32(raw) {
            Some(Command::GetFormat) => {
                let format = *shared.format.lock().unwrap();
                let Some(format) = format else {
                    error!("format requested before capture start");
                    break;
                };
                match protocol::format_reply(&format) {
                    Ok(frame) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("format reply for tcp://{addr}: {e}");
                        break;
                    }
                }
            }
            Some(Command::StartPlay) => match shared.registry.add(conn_id, addr) {
                Ok(info) => {
                    info!("start play id:{} tcp://{addr}", info.id);
                    if frame_tx.send(protocol::start_reply(info.id)).is_err() {
                        break;
                    }
                    tokio::spawn(heartbeat_loop(
                        shared.clone(),
                        conn_id,
                        frame_tx.clone(),
                        close_tx.clone(),
                        close_rx.clone(),
                    ));
                }
                Err(e) => {
                    error!("rejecting play from tcp://{addr}: {e}");
                    break;
                }
            },
            Some(Command::Heartbeat) => {
                shared.registry.touch(conn_id);
            }
            Some(Command::None) | None => {
                error!("unknown command {raw} from tcp://{addr}");
                break;
            }
        }
    }
}

/// Pings a playing peer every [`HEARTBEAT_INTERVAL`] and drops it when it
/// stays silent past [`HEARTBEAT_TIMEOUT`]
async fn heartbeat_loop(
    shared: Arc<ServerShared>,
    conn_id: u64,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    close_tx: Arc<watch::Sender<bool>>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            _ = close_rx.changed() => break,
        }
        let Some(info) = shared.registry.get(conn_id) else {
            break;
        };
        if info.is_stale(HEARTBEAT_TIMEOUT) {
            info!("heartbeat timeout id:{} tcp://{}", info.id, info.addr);
            shared.registry.remove(conn_id);
            let _ = close_tx.send(true);
            break;
        }
        if frame_tx.send(protocol::heartbeat_frame()).is_err() {
            break;
        }
    }
}

/// Accepts 4-byte registration datagrams and attaches the source endpoint
/// to the matching peer
async fn udp_register_loop(shared: Arc<ServerShared>, udp: Arc<UdpSocket>) {
    let mut buf = [0u8; 8];
    loop {
        let (len, src) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("udp receive failed: {e}");
                break;
            }
        };
        if len != 4 {
            debug!("ignoring {len}-byte datagram from {src}");
            continue;
        }
        let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match shared.registry.fill_udp_endpoint(id, src) {
            Some(endpoint) => info!("fill udp peer id:{id} udp://{endpoint}"),
            None => warn!("no playing peer with id:{id} for udp://{src}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Encoding;
    use std::io::{Read, Write};
    use std::time::Duration;

    struct NullCapture {
        format: AudioFormat,
    }

    impl NullCapture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                format: AudioFormat {
                    encoding: Encoding::S16,
                    channels: 2,
                    sample_rate: 48000,
                },
            })
        }
    }

    impl CaptureSource for NullCapture {
        fn start(&self, _sink: Arc<dyn AudioSink>, _config: &CaptureConfig) -> Result<AudioFormat> {
            Ok(self.format)
        }

        fn stop(&self) {}
    }

    fn start_test_server() -> (Arc<StreamServer>, SocketAddr) {
        let server = Arc::new(StreamServer::new(NullCapture::new()));
        server
            .start_server("127.0.0.1", 0, &CaptureConfig::default())
            .unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    fn read_exact(stream: &mut std::net::TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_format_and_play_handshake() {
        let (server, addr) = start_test_server();

        let mut control = std::net::TcpStream::connect(addr).unwrap();
        control
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // GET_FORMAT echoes the command, a size, and the proto bytes
        control.write_all(&1u32.to_le_bytes()).unwrap();
        let head = read_exact(&mut control, 8);
        assert_eq!(&head[0..4], &1u32.to_le_bytes());
        assert_eq!(&head[4..8], &8u32.to_le_bytes());
        let body = read_exact(&mut control, 8);
        assert_eq!(body, vec![0x08, 0x03, 0x10, 0x02, 0x18, 0x80, 0xF7, 0x02]);

        // START_PLAY admits the peer as id 1
        control.write_all(&2u32.to_le_bytes()).unwrap();
        let reply = read_exact(&mut control, 8);
        assert_eq!(&reply[0..4], &2u32.to_le_bytes());
        assert_eq!(&reply[4..8], &1u32.to_le_bytes());

        // a second listener gets the next id
        let mut second = std::net::TcpStream::connect(addr).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        second.write_all(&2u32.to_le_bytes()).unwrap();
        let reply = read_exact(&mut second, 8);
        assert_eq!(&reply[4..8], &2u32.to_le_bytes());

        server.stop_server();
        assert!(!server.is_running());
    }

    #[test]
    fn test_udp_registration_and_fanout() {
        let (server, addr) = start_test_server();

        let mut control = std::net::TcpStream::connect(addr).unwrap();
        control
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        control.write_all(&2u32.to_le_bytes()).unwrap();
        let reply = read_exact(&mut control, 8);
        let peer_id = u32::from_le_bytes(reply[4..8].try_into().unwrap());

        let data_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        data_socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        data_socket
            .send_to(&peer_id.to_le_bytes(), addr)
            .unwrap();
        // registration is processed on the reactor
        std::thread::sleep(Duration::from_millis(300));

        // 5776 bytes at align 4: ceil(5776 / 1440) = 5 datagrams
        let chunk: Vec<u8> = (0..5776u32).map(|i| i as u8).collect();
        server.broadcast_audio_data(&chunk, 4);

        let mut buf = [0u8; 2048];
        let mut total = 0usize;
        let mut sizes = Vec::new();
        for _ in 0..5 {
            let len = data_socket.recv(&mut buf).unwrap();
            assert!(len <= MAX_UDP_PAYLOAD);
            assert_eq!(len % 4, 0);
            sizes.push(len);
            total += len;
        }
        assert_eq!(total, chunk.len());
        assert_eq!(sizes.iter().filter(|&&len| len == 1440).count(), 4);
        assert_eq!(sizes.iter().filter(|&&len| len == 16).count(), 1);

        server.stop_server();
    }

    #[test]
    fn test_unknown_command_closes_connection() {
        let (server, addr) = start_test_server();

        let mut control = std::net::TcpStream::connect(addr).unwrap();
        control
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        control.write_all(&99u32.to_le_bytes()).unwrap();

        let mut buf = [0u8; 4];
        // server shuts the stream down; read reports EOF or reset
        match control.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {n}-byte reply"),
            Err(_) => {}
        }

        server.stop_server();
    }

    #[test]
    fn test_duplicate_start_play_rejected() {
        let (server, addr) = start_test_server();

        let mut control = std::net::TcpStream::connect(addr).unwrap();
        control
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        control.write_all(&2u32.to_le_bytes()).unwrap();
        let _ = read_exact(&mut control, 8);

        control.write_all(&2u32.to_le_bytes()).unwrap();
        let mut buf = [0u8; 4];
        match control.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {n}-byte reply"),
            Err(_) => {}
        }

        server.stop_server();
    }
}
