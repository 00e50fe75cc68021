//! End-to-end tests against a fake remote agent over loopback TCP

use async_smux::MuxBuilder;
use muxhaul_proto::{receive_signal, send_signal};
use muxhaul_server::{
    ServerConfig, ServerError, Supervisor, TcpMuxServer, TunnelConfig, TunnelStatus,
    STATUS_CONNECTED, STATUS_DISCONNECTED,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "test-token";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn server_config(bind: SocketAddr, ports: Vec<String>, mux_con: usize) -> ServerConfig {
    let mut config = TunnelConfig {
        bind_addr: bind.to_string(),
        token: TOKEN.to_string(),
        mux_con,
        heartbeat: 60,
        ports,
        ..Default::default()
    }
    .resolve()
    .unwrap();
    config.restart_grace = Duration::from_millis(100);
    config
}

struct Running {
    status_handle: TunnelStatus,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    fn start(config: ServerConfig) -> Self {
        let server = TcpMuxServer::new(config);
        let status_handle = server.status();
        let supervisor = server.supervisor().clone();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.run());
        Self {
            status_handle,
            supervisor,
            shutdown,
            task,
        }
    }

    fn status(&self) -> String {
        self.status_handle.get()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn connect_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("could not connect to {}", addr);
}

/// Authenticate a control channel and return it
async fn open_control(addr: SocketAddr) -> TcpStream {
    let mut control = connect_retry(addr).await;
    send_signal(&mut control, TOKEN).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), receive_signal(&mut control))
        .await
        .expect("no token echo")
        .unwrap();
    assert_eq!(echoed, TOKEN);
    control
}

/// Open a tunnel connection that echoes every mux stream and reports the
/// announced target of each one
async fn open_echo_tunnel(addr: SocketAddr) -> mpsc::UnboundedReceiver<String> {
    let conn = TcpStream::connect(addr).await.unwrap();
    let (targets_tx, targets_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut builder = MuxBuilder::server();
        let (_connector, mut acceptor, worker) = builder.with_connection(conn).build();
        tokio::spawn(worker);

        while let Some(mut stream) = acceptor.accept().await {
            let targets_tx = targets_tx.clone();
            tokio::spawn(async move {
                let target = receive_signal(&mut stream).await.unwrap();
                let _ = targets_tx.send(target);

                let mut buf = vec![0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = stream.flush().await;
                        }
                    }
                }
            });
        }
    });

    targets_rx
}

async fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server did not close the connection");
    assert!(matches!(read, Ok(0) | Err(_)));
}

async fn assert_silent(stream: &mut TcpStream, for_ms: u64) {
    let mut buf = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(for_ms), stream.read(&mut buf))
            .await
            .is_err(),
        "unexpected data on control channel"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_relays_and_signals_once() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let local_addr = free_addr().await;
    let running = Running::start(server_config(
        tunnel_addr,
        vec![format!("{}=127.0.0.1:9090", local_addr)],
        2,
    ));

    let mut control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;

    let mut targets = open_echo_tunnel(tunnel_addr).await;

    let mut clients = Vec::new();
    for message in [&b"first"[..], &b"second"[..]] {
        let mut client = connect_retry(local_addr).await;
        client.write_all(message).await.unwrap();
        let mut buf = vec![0u8; message.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(buf, message);
        clients.push(client);
    }

    for _ in 0..2 {
        let target = timeout(Duration::from_secs(5), targets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target, "127.0.0.1:9090");
    }

    let signal = timeout(Duration::from_secs(5), receive_signal(&mut control))
        .await
        .expect("no batch-ready signal")
        .unwrap();
    assert_eq!(signal, "1");
    assert_silent(&mut control, 300).await;

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_token_then_good_handshake() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let running = Running::start(server_config(tunnel_addr, vec![], 8));

    let mut intruder = connect_retry(tunnel_addr).await;
    send_signal(&mut intruder, "wrong").await.unwrap();
    assert_closed_by_server(&mut intruder).await;
    assert_eq!(running.status(), STATUS_DISCONNECTED);

    let _control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;
    assert_eq!(running.supervisor.restart_count(), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_timeout_then_success() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let running = Running::start(server_config(tunnel_addr, vec![], 8));

    let mut silent = connect_retry(tunnel_addr).await;
    assert_closed_by_server(&mut silent).await;

    let _control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_pool_drops_connection() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let mut config = server_config(tunnel_addr, vec![], 8);
    config.channel_size = 1;
    let running = Running::start(config);

    let _control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;

    let _pooled = TcpStream::connect(tunnel_addr).await.unwrap();
    let supervisor = running.supervisor.clone();
    wait_until("pooled connection", || {
        supervisor.current_generation().pool().len() == 1
    })
    .await;

    let mut dropped = TcpStream::connect(tunnel_addr).await.unwrap();
    assert_closed_by_server(&mut dropped).await;
    assert_eq!(running.supervisor.current_generation().pool().len(), 1);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_signal_restarts_once() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let running = Running::start(server_config(tunnel_addr, vec![], 8));

    let mut control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;

    let _pooled = TcpStream::connect(tunnel_addr).await.unwrap();
    let supervisor = running.supervisor.clone();
    wait_until("pooled connection", || {
        supervisor.current_generation().pool().len() == 1
    })
    .await;
    let first = supervisor.current_generation();

    send_signal(&mut control, "closed").await.unwrap();
    assert_closed_by_server(&mut control).await;

    wait_until("restart", || supervisor.restart_count() == 1).await;
    assert!(first.is_cancelled());
    assert!(first.pool().is_empty());

    let second = supervisor.current_generation();
    assert_ne!(second.id(), first.id());
    assert!(second.pool().is_empty());
    assert!(!second.control().is_installed());

    // The new generation wants a fresh handshake
    let _control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;
    assert_eq!(supervisor.restart_count(), 1);

    running.stop().await;
}

async fn wait_refused(addr: SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} still accepts connections", addr);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_drops_queued_clients_and_waits_for_handshake() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let local_addr = free_addr().await;
    let running = Running::start(server_config(
        tunnel_addr,
        vec![format!("{}=127.0.0.1:9090", local_addr)],
        1,
    ));

    let mut control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;

    // No tunnel connection yet, so the client waits in the mapping queue
    let mut queued = connect_retry(local_addr).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    send_signal(&mut control, "closed").await.unwrap();
    assert_closed_by_server(&mut queued).await;

    let supervisor = running.supervisor.clone();
    wait_until("restart", || supervisor.restart_count() == 1).await;
    wait_until("listening again", || {
        running.status() == STATUS_DISCONNECTED
    })
    .await;

    // Mapping listeners stay down until the agent authenticates again
    wait_refused(local_addr).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(TcpStream::connect(local_addr).await.is_err());

    let _control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;
    let mut targets = open_echo_tunnel(tunnel_addr).await;

    let mut client = connect_retry(local_addr).await;
    client.write_all(b"after restart").await.unwrap();
    let mut buf = [0u8; 13];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"after restart");

    let target = timeout(Duration::from_secs(5), targets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target, "127.0.0.1:9090");
    assert_eq!(supervisor.restart_count(), 1);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_control_eof_restarts() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let running = Running::start(server_config(tunnel_addr, vec![], 8));

    let control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;
    drop(control);

    let supervisor = running.supervisor.clone();
    wait_until("restart", || supervisor.restart_count() == 1).await;
    wait_until("listening again", || {
        running.status() == STATUS_DISCONNECTED
    })
    .await;

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_sent() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let mut config = server_config(tunnel_addr, vec![], 8);
    config.heartbeat = Duration::from_millis(200);
    let running = Running::start(config);

    let mut control = open_control(tunnel_addr).await;
    for _ in 0..2 {
        let signal = timeout(Duration::from_secs(5), receive_signal(&mut control))
            .await
            .expect("no heartbeat")
            .unwrap();
        assert_eq!(signal, "0");
    }
    assert_eq!(running.supervisor.restart_count(), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tunnel_bind_failure_is_fatal() {
    init_tracing();
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let server = TcpMuxServer::new(server_config(addr, vec![], 8));
    let result = timeout(Duration::from_secs(5), server.run())
        .await
        .expect("run did not return");
    assert!(matches!(result, Err(ServerError::BindError { .. })));
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn test_foreign_ip_discarded() {
    init_tracing();
    let tunnel_addr = free_addr().await;
    let running = Running::start(server_config(tunnel_addr, vec![], 8));

    let _control = open_control(tunnel_addr).await;
    wait_until("control channel", || running.status() == STATUS_CONNECTED).await;

    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut foreign = socket.connect(tunnel_addr).await.unwrap();
    assert_closed_by_server(&mut foreign).await;
    assert!(running.supervisor.current_generation().pool().is_empty());

    running.stop().await;
}
