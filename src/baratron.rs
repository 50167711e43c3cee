//! Baratron capacitance manometer client.
//!
//! The controller answers a `p\r\n` request with a single line holding two
//! channel readings. Only the first channel is wired up, so the second always
//! reads `Off`:
//!
//! ```text
//! 973.1e+0 Off
//! -10.8e+0 Off
//! - 9.1e+0 Off      <- negative values sometimes arrive with a detached sign
//! ```

use crate::config::BaratronConfig;
use crate::error::{Error, Result};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SENSOR: &str = "Baratron";
const REQUEST: &[u8] = b"p\r\n";
const UNUSED_CHANNEL: &str = "Off";

pub struct BaratronReader {
    address: String,
    read_timeout: Duration,
    stream: BufReader<TcpStream>,
    line: String,
}

impl BaratronReader {
    pub async fn connect(cfg: &BaratronConfig) -> Result<Self> {
        let read_timeout = cfg.read_timeout();
        let stream = open(&cfg.address, read_timeout).await?;
        Ok(BaratronReader {
            address: cfg.address.clone(),
            read_timeout,
            stream,
            line: String::new(),
        })
    }

    /// Drop the current connection and dial again. Used after a transient
    /// fault so a late reply can't be paired with the next request.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.stream = open(&self.address, self.read_timeout).await?;
        Ok(())
    }

    /// Request one pressure reading.
    pub async fn read(&mut self) -> Result<f64> {
        self.line.clear();
        let stream = &mut self.stream;
        let line = &mut self.line;
        let exchange = async {
            stream.get_mut().write_all(REQUEST).await?;
            stream.read_line(line).await
        };

        let n = match timeout(self.read_timeout, exchange).await {
            Err(_) => return Err(Error::Timeout(SENSOR)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(Error::decode(SENSOR, format!("reply is not ASCII: {}", e), &[]));
            }
            Ok(result) => result?,
        };
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Baratron closed the connection",
            )));
        }

        decode_line(&self.line)
    }
}

async fn open(address: &str, connect_timeout: Duration) -> Result<BufReader<TcpStream>> {
    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::Timeout(SENSOR))??;
    stream.set_nodelay(true)?;
    match stream.peer_addr() {
        Ok(peer) => tracing::info!("Baratron connected to {}", peer),
        Err(_) => tracing::info!("Baratron connected to {}", address),
    }
    Ok(BufReader::new(stream))
}

/// Decode one response line into a pressure value.
pub fn decode_line(line: &str) -> Result<f64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [value, last] => {
            expect_unused_channel(last, &tokens)?;
            parse_value(value, &tokens)
        }
        [sign, value, last] => {
            expect_unused_channel(last, &tokens)?;
            if *sign != "-" {
                return Err(Error::decode(SENSOR, format!("expected \"-\", got {}", sign), &tokens));
            }
            Ok(-parse_value(value, &tokens)?)
        }
        _ => Err(Error::decode(
            SENSOR,
            format!("expected 2 or 3 entries, got {}", tokens.len()),
            &tokens,
        )),
    }
}

fn expect_unused_channel(last: &str, tokens: &[&str]) -> Result<()> {
    if last == UNUSED_CHANNEL {
        Ok(())
    } else {
        Err(Error::decode(SENSOR, "expected second sensor to be \"Off\"", tokens))
    }
}

fn parse_value(value: &str, tokens: &[&str]) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| Error::decode(SENSOR, format!("bad number {:?}: {}", value, e), tokens))
}
