#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use webterm::api::auth::{TicketStore, TokenStore};
use webterm::api::{router, AppState};
use webterm::protocol::{AckStatus, Frame};
use webterm::session::SessionRegistry;
use webterm::shutdown::ShutdownCoordinator;

pub const TEST_USER: &str = "alice";
pub const TEST_TOKEN: &str = "test-token-alice";

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
}

/// Start a real server on an ephemeral port with one registered token.
pub async fn start_server() -> TestServer {
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(600)));
    tokens.register(TEST_TOKEN, TEST_USER);
    let state = AppState {
        sessions: SessionRegistry::new(),
        shutdown: ShutdownCoordinator::new(),
        tokens,
        tickets: Arc::new(TicketStore::new()),
    };
    let app = router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    TestServer {
        addr,
        state,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    pub async fn create_session(&self, name: Option<&str>) -> serde_json::Value {
        eprintln!("DEBUG: create_session start");
        let body = match name {
            Some(n) => serde_json::json!({ "name": n }),
            None => serde_json::json!({}),
        };
        let resp = self
            .client
            .post(format!("http://{}/v1/sessions", self.addr))
            .bearer_auth(TEST_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        eprintln!("DEBUG: create_session got response {}", resp.status());
        assert_eq!(resp.status(), 201, "session create should succeed");
        let v = resp.json().await.unwrap();
        eprintln!("DEBUG: create_session json parsed");
        v
    }

    pub async fn ws_ticket_for(&self, token: &str) -> String {
        let resp = self
            .client
            .post(format!("http://{}/v1/auth/ws-ticket", self.addr))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "ticket issue should succeed");
        let body: serde_json::Value = resp.json().await.unwrap();
        body["ticket"].as_str().unwrap().to_string()
    }

    /// Open a stream to `session_id` via the ticket flow.
    pub async fn connect_stream(&self, session_id: &str) -> Ws {
        self.connect_stream_as(session_id, TEST_TOKEN).await
    }

    pub async fn connect_stream_as(&self, session_id: &str, token: &str) -> Ws {
        eprintln!("DEBUG: connect_stream_as start");
        let ticket = self.ws_ticket_for(token).await;
        eprintln!("DEBUG: got ticket {}", ticket);
        let url = format!(
            "ws://{}/v1/sessions/{}/stream?ticket={}",
            self.addr, session_id, ticket
        );
        let (socket, _) = connect_async(url).await.expect("ws connect");
        eprintln!("DEBUG: ws connected");
        Ws { socket }
    }
}

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A connected stream speaking the binary frame protocol.
pub struct Ws {
    pub socket: WsStream,
}

impl Ws {
    pub async fn send_frame(&mut self, frame: Frame) {
        self.socket
            .send(Message::Binary(frame.encode()))
            .await
            .expect("ws send");
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) {
        self.send_frame(Frame::Resize { cols, rows }).await;
    }

    /// Next decoded frame, skipping transport ping/pong.
    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("ws error");
            match msg {
                Message::Binary(data) => return Frame::decode(&data).expect("decodable frame"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    /// Receive frames until one matches, returning it. Panics after 10s.
    pub async fn recv_until(&mut self, mut pred: impl FnMut(&Frame) -> bool) -> Frame {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no matching frame within deadline"
            );
            let frame = self.recv_frame().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    pub async fn expect_write_state(&mut self, writer: bool) {
        let frame = self
            .recv_until(|f| matches!(f, Frame::WriteState(_)))
            .await;
        assert_eq!(frame, Frame::WriteState(writer));
    }

    pub async fn expect_resize_notify(&mut self, cols: u16, rows: u16) {
        self.recv_until(|f| matches!(f, Frame::ResizeNotify { cols: c, rows: r } if *c == cols && *r == rows))
            .await;
    }

    pub async fn expect_ack(&mut self, status: AckStatus, message: &str) {
        let frame = self.recv_until(|f| matches!(f, Frame::FileAck { .. })).await;
        assert_eq!(frame, Frame::ack(status, message));
    }

    /// Accumulate STDOUT payloads until the text contains `needle`.
    pub async fn collect_stdout_until(&mut self, needle: &str) -> Vec<u8> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !String::from_utf8_lossy(&collected).contains(needle) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "output never contained {needle:?}; got: {}",
                String::from_utf8_lossy(&collected)
            );
            if let Frame::Stdout(data) = self.recv_frame().await {
                collected.extend_from_slice(&data);
            }
        }
        collected
    }

    /// Wait for the server to close the connection, returning the close
    /// frame if one was sent.
    pub async fn expect_close(&mut self) -> Option<(u16, String)> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for close");
            match msg {
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| (f.code.into(), f.reason.to_string()))
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}
