//! Loopback stand-ins for the Baratron and HIPPO used by the session and
//! listener tests.

use crate::config::{
    AppConfig, BaratronConfig, ClockConfig, HippoConfig, ListenerConfig, RetryConfig, SessionConfig,
};
use crate::recorder::SessionController;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// One full gauge set, mixed with traffic the reader ignores.
pub const GAUGE_ROUND: &[&str] = &[
    "m vac_3 7.0 8.0 9.0",
    "turbo 0 309 000820",
    "m vac_1 1.0 2.0 3.0",
    "pumpStatus 6 1",
    "m vac_4 10.0 11.0 12.0",
    "m vac_2 4.0 5.0 6.0",
];

/// Pump chatter with no gauge reports at all.
pub const PUMP_STATUS_ONLY: &[&str] = &["pumpStatus 6 1"];

/// Baratron answering every request with `reply`.
pub async fn spawn_baratron(reply: &'static str) -> String {
    serve_baratron(reply, 0).await
}

/// Baratron that hangs up on its first connection, then behaves like
/// [`spawn_baratron`].
pub async fn spawn_baratron_dropping_first(reply: &'static str) -> String {
    serve_baratron(reply, 1).await
}

async fn serve_baratron(reply: &'static str, mut drop_first: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if drop_first > 0 {
                drop_first -= 1;
                drop(stream);
                continue;
            }
            tokio::spawn(answer_requests(stream, reply));
        }
    });
    address
}

async fn answer_requests(stream: TcpStream, reply: &'static str) {
    let mut stream = BufReader::new(stream);
    let mut request = String::new();
    while stream.read_line(&mut request).await.unwrap_or(0) > 0 {
        request.clear();
        if stream.get_mut().write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// HIPPO pushing full gauge sets to a free port.
pub async fn spawn_hippo() -> String {
    spawn_hippo_sending(GAUGE_ROUND).await
}

/// HIPPO repeating `round` to a free port every few milliseconds.
pub async fn spawn_hippo_sending(round: &'static [&'static str]) -> String {
    let port = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let target = format!("127.0.0.1:{}", port);
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = target.clone();
    tokio::spawn(async move {
        loop {
            for msg in round {
                let _ = sender.send_to(msg.as_bytes(), &dest).await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    target
}

/// Fast-cycling config pointing at the given stand-in addresses.
pub fn config_for(dir: &TempDir, baratron: String, hippo: String) -> AppConfig {
    AppConfig {
        listener: ListenerConfig { bind: "127.0.0.1:0".to_string(), read_timeout_ms: 500 },
        baratron: BaratronConfig { address: baratron, read_timeout_ms: 500 },
        hippo: HippoConfig { bind: hippo, read_timeout_ms: 500 },
        session: SessionConfig {
            output_dir: dir.path().to_path_buf(),
            sample_interval_ms: 20,
            join_timeout_ms: 5000,
        },
        retry: RetryConfig::default(),
        clock: ClockConfig::default(),
    }
}

pub async fn test_config(dir: &TempDir, baratron_reply: &'static str) -> AppConfig {
    config_for(dir, spawn_baratron(baratron_reply).await, spawn_hippo().await)
}

pub async fn controller(dir: &TempDir, baratron_reply: &'static str) -> SessionController {
    SessionController::new(Arc::new(test_config(dir, baratron_reply).await))
}
