use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use skirmish::game::{register_client_handlers, register_server_handlers, GameState};
use skirmish::net::transport::{SocketConnector, SocketListener};
use skirmish::net::{
    ClientSession, HandshakeState, MessageRegistry, NetConfig, PeerAddr, ServerSession, SessionEvent,
    Transport, TransportError,
};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_loopback_handshake_over_tcp_and_udp() {
    let runtime = runtime();
    let registry = Arc::new(MessageRegistry::standard().unwrap());

    let listener = SocketListener::bind(runtime.handle(), loopback()).unwrap();
    let server_addr = listener.socket_addr();
    let mut server = ServerSession::new(NetConfig::default(), Arc::clone(&registry), Box::new(listener));
    register_server_handlers(server.handlers_mut());
    let mut server_game = GameState::default();

    let (tx, rx) = mpsc::channel();
    let connector = SocketConnector::start(runtime.handle(), vec![server_addr], loopback()).unwrap();
    let mut client = ClientSession::new(NetConfig::default(), registry);
    register_client_handlers(client.handlers_mut());
    client.connect(
        Box::new(connector),
        Some(Box::new(move |result: Result<PeerAddr, &TransportError>| {
            let _ = tx.send(result.ok());
        })),
    );
    let mut client_game = GameState::default();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let now = Instant::now();
        server.tick(&mut server_game, now);
        client.tick(&mut client_game, now);
        if client.is_connected() && server.handshaken_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert!(client.is_connected());
    assert_eq!(server.handshaken_count(), 1);
    assert_eq!(rx.try_recv().ok().flatten(), Some(PeerAddr::Socket(server_addr)));

    let connection = server.connections().next().unwrap();
    assert_eq!(connection.connection.handshake_state(), HandshakeState::Handshaken);
    assert!(connection.connection.transport().unreliable_remote().is_some());
}

#[test]
fn test_unreachable_candidates_report_failure() {
    let runtime = runtime();
    // Bind and release a port so nothing listens on it.
    let closed = std::net::TcpListener::bind(loopback())
        .and_then(|listener| listener.local_addr())
        .unwrap();

    let connector = SocketConnector::start(runtime.handle(), vec![closed], loopback()).unwrap();
    let mut client: ClientSession<GameState> =
        ClientSession::new(NetConfig::default(), Arc::new(MessageRegistry::standard().unwrap()));
    let (tx, rx) = mpsc::channel();
    client.connect(
        Box::new(connector),
        Some(Box::new(move |result: Result<PeerAddr, &TransportError>| {
            let _ = tx.send(result.is_err());
        })),
    );
    let mut game = GameState::default();

    let deadline = Instant::now() + Duration::from_secs(5);
    while client.is_connecting() && Instant::now() < deadline {
        client.tick(&mut game, Instant::now());
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(rx.try_recv(), Ok(true));
    assert!(
        client
            .drain_events()
            .any(|event| matches!(event, SessionEvent::ConnectFailed { .. }))
    );
}
