use duet::config::ServerConfig;
use duet::matchmaker::Matchmaker;
use duet::protocol::{ClientMessage, ServerMessage};
use duet::server::ServerState;
use duet::verify::Verifier;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        msg_rate: 100,
        rate_window_ms: 1000,
        max_payload: 2_097_152,
        verify_timeout: 5,
        ping_interval: 30,
    }
}

pub fn make_state(config: ServerConfig, verifier: Verifier) -> Arc<ServerState> {
    make_state_with_gate_slots(config, verifier, 1000)
}

pub fn make_state_with_gate_slots(
    config: ServerConfig,
    verifier: Verifier,
    slots: usize,
) -> Arc<ServerState> {
    Arc::new(ServerState {
        matchmaker: Matchmaker::new(),
        verifier,
        config,
        ip_connections: dashmap::DashMap::new(),
        active_connections: AtomicUsize::new(0),
        next_conn_id: AtomicU64::new(1),
        pre_verify_semaphore: tokio::sync::Semaphore::new(slots),
    })
}

pub fn pass_through_verifier() -> Verifier {
    Verifier::new("http://127.0.0.1:1/unused", None).unwrap()
}

async fn spawn_server(state: Arc<ServerState>, listener: TcpListener) {
    tokio::spawn(async move {
        if let Err(e) = duet::run(listener, state).await {
            eprintln!("server error in test: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = make_state(test_config(addr), pass_through_verifier());
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_gate_slots(slots: usize) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = make_state_with_gate_slots(test_config(addr), pass_through_verifier(), slots);
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_msg_rate(msg_rate: u32) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config.msg_rate = msg_rate;
    let state = make_state(config, pass_through_verifier());
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_ping_interval(secs: u64) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config.ping_interval = secs;
    let state = make_state(config, pass_through_verifier());
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_verifier(verifier: Verifier) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = make_state(test_config(addr), verifier);
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl TestClient {
    /// Connect without going through the verification gate.
    pub async fn connect_unverified(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect and pass the verification gate with the given token.
    pub async fn connect_with_token(addr: &SocketAddr, token: &str) -> Self {
        let mut client = Self::connect_unverified(addr).await;
        client
            .send(&ClientMessage::VerifyCaptcha {
                token: token.to_string(),
            })
            .await;
        let msg = client.recv().await;
        assert_eq!(msg, ServerMessage::CaptchaSuccess, "verification failed");
        client
    }

    /// Connect and pass the pass-through verification gate.
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::connect_with_token(addr, "test-token").await
    }

    pub async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).unwrap();
        self.ws_tx.send(Message::Text(json)).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Receive the next protocol message, skipping transport pings/pongs.
    pub async fn recv(&mut self) -> ServerMessage {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for server message")
    }

    /// Receive the next protocol message within the given window, or
    /// `None` if the server stayed silent or closed the connection.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws_rx.next())
                .await
                .ok()??;
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("unparseable server message"))
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(other) => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// True once the server has closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        self.recv_timeout(Duration::from_secs(5)).await.is_none()
    }
}
