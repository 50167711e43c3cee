//! Control socket for run start/stop.
//!
//! The DAQ sends one line per connection, `Begin <run>` or `End <run>`, and
//! hangs up. Nothing is written back.

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::recorder::SessionController;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const MAX_COMMAND_LEN: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Begin,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub run_number: u32,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [kind, run] = tokens.as_slice() else {
            return Err(Error::Protocol(format!(
                "expected \"<Begin|End> <run>\", got {} tokens in {:?}",
                tokens.len(),
                line
            )));
        };

        let kind = match *kind {
            "Begin" => CommandKind::Begin,
            "End" => CommandKind::End,
            other => return Err(Error::Protocol(format!("unknown command {:?}", other))),
        };
        let run_number = run
            .parse::<u32>()
            .map_err(|_| Error::Protocol(format!("bad run number {:?}", run)))?;

        Ok(Command { kind, run_number })
    }
}

pub struct CommandListener {
    listener: TcpListener,
    controller: Arc<SessionController>,
    read_timeout: Duration,
}

impl CommandListener {
    pub async fn bind(cfg: &ListenerConfig, controller: Arc<SessionController>) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.bind).await?;
        Ok(CommandListener { listener, controller, read_timeout: cfg.read_timeout() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve control connections one at a time, forever.
    pub async fn run(&self) -> Result<()> {
        loop {
            tracing::debug!("Waiting for a connection");
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            tracing::info!("Connection from {}", peer);

            if let Err(e) = self.handle(stream).await {
                tracing::warn!("command from {} rejected: {}", peer, e);
            }
        }
    }

    /// Read, parse and dispatch one command. The stream is dropped, and so
    /// closed, on every return path.
    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let line = self.read_line(&mut stream).await?;
        tracing::info!("Received {:?}", line);
        let command: Command = line.parse()?;
        self.dispatch(command).await
    }

    async fn read_line(&self, stream: &mut TcpStream) -> Result<String> {
        let mut reader = BufReader::new(stream.take(MAX_COMMAND_LEN));
        let mut buf = Vec::new();
        timeout(self.read_timeout, reader.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| Error::Protocol("timed out waiting for a command".to_string()))??;
        String::from_utf8(buf).map_err(|_| Error::Protocol("command is not valid UTF-8".to_string()))
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        match command.kind {
            CommandKind::Begin => self.controller.begin(command.run_number).await,
            CommandKind::End => {
                let summary = self.controller.end(command.run_number).await?;
                if let Some(reason) = &summary.aborted {
                    tracing::warn!("run {} had aborted early: {}", summary.run_number, reason);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "Begin 7".parse::<Command>().unwrap(),
            Command { kind: CommandKind::Begin, run_number: 7 }
        );
        assert_eq!(
            "  End   12\r\n".parse::<Command>().unwrap(),
            Command { kind: CommandKind::End, run_number: 12 }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        for line in ["", "Begin", "Begin 7 8", "Start 7", "begin 7", "End seven", "End -1"] {
            assert!(matches!(line.parse::<Command>(), Err(Error::Protocol(_))), "{:?}", line);
        }
    }

    async fn start_listener(dir: &TempDir) -> (Arc<SessionController>, SocketAddr) {
        let config = testutil::test_config(dir, "973.1e+0 Off\r\n").await;
        let controller = Arc::new(SessionController::new(Arc::new(config.clone())));
        let listener = CommandListener::bind(&config.listener, controller.clone()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { listener.run().await });
        (controller, addr)
    }

    /// Send one line and wait for the listener to hang up. Returns whatever it wrote back.
    async fn send(addr: SocketAddr, line: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_begin_and_end_over_socket() {
        let dir = TempDir::new().unwrap();
        let (controller, addr) = start_listener(&dir).await;

        assert!(send(addr, "Begin 7\n").await.is_empty());
        assert_eq!(controller.active_run().await, Some(7));

        assert!(send(addr, "End 7\n").await.is_empty());
        assert_eq!(controller.active_run().await, None);
        assert!(dir.path().join("pressures_run-0007.log.manifest.json").exists());
    }

    #[tokio::test]
    async fn test_bad_commands_leave_state_alone() {
        let dir = TempDir::new().unwrap();
        let (controller, addr) = start_listener(&dir).await;

        for line in ["Hello\n", "Begin\n", "End 9\n", "Begin 1 2\n"] {
            assert!(send(addr, line).await.is_empty());
            assert_eq!(controller.active_run().await, None);
        }

        send(addr, "Begin 3").await;
        assert_eq!(controller.active_run().await, Some(3));

        for line in ["Begin 4\n", "End 5\n", "Stop 3\n"] {
            send(addr, line).await;
            assert_eq!(controller.active_run().await, Some(3));
        }

        send(addr, "End 3\n").await;
        assert_eq!(controller.active_run().await, None);
    }
}
