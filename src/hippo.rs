//! HIPPO pump/gauge controller listener.
//!
//! The controller broadcasts plain-text UDP datagrams and never expects a
//! request. Three message families show up on the port (see the Pfeiffer
//! "Pumping Operations With DCU" manual for the turbo parameters):
//!
//! | Family | Example | Handling |
//! |--------|---------|----------|
//! | Pump on/off (param 010, roots blowers) | `turbo 2 010 111111`, `pumpStatus 7 0` | ignored |
//! | Turbo rotation speed (param 309) | `turbo 0 309 000820` | ignored |
//! | Gauge report | `m vac_3 1.2e-6 4.0e-2 3.9e-2` | consumed |
//!
//! Anything else is treated as a protocol violation.

use crate::config::HippoConfig;
use crate::error::{Error, Result};
use crate::sample::{VacuumGaugeReading, GAUGE_COUNT};
#[cfg(test)]
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

const SENSOR: &str = "HIPPO";
const MAX_DATAGRAM_SIZE: usize = 1024;
const TURBO_PUMPS: [&str; 5] = ["0", "1", "2", "3", "4"];
const ROOTS_PUMPS: [&str; 5] = ["6", "7", "8", "10", "11"];
const ROTATION_PREFIX_LEN: usize = 11;
const GAUGE_PREFIX_LEN: usize = 7;

/// A classified HIPPO datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum HippoMessage {
    PumpState,
    RotationSpeed,
    Gauge {
        /// 1-based gauge number.
        index: usize,
        reading: VacuumGaugeReading,
    },
}

/// Classify one datagram payload.
pub fn classify(data: &str) -> Result<HippoMessage> {
    let msg = data.trim_end_matches(['\r', '\n', '\0']);

    if is_pump_state(msg) {
        return Ok(HippoMessage::PumpState);
    }
    if msg.get(..ROTATION_PREFIX_LEN).is_some_and(is_rotation_speed) {
        return Ok(HippoMessage::RotationSpeed);
    }
    if msg.get(..GAUGE_PREFIX_LEN).is_some_and(is_gauge_prefix) {
        return decode_gauge(msg);
    }

    Err(Error::decode(
        SENSOR,
        format!("unexpected data {:?}", msg),
        &msg.split_whitespace().collect::<Vec<_>>(),
    ))
}

fn is_pump_state(msg: &str) -> bool {
    let tokens: Vec<&str> = msg.split(' ').collect();
    match tokens.as_slice() {
        ["turbo", pump, "010", state] => {
            TURBO_PUMPS.contains(pump) && matches!(*state, "000000" | "111111")
        }
        ["pumpStatus", pump, state] => ROOTS_PUMPS.contains(pump) && matches!(*state, "0" | "1"),
        _ => false,
    }
}

fn is_rotation_speed(prefix: &str) -> bool {
    let tokens: Vec<&str> = prefix.split(' ').collect();
    matches!(tokens.as_slice(), ["turbo", pump, "309"] if TURBO_PUMPS.contains(pump))
}

fn is_gauge_prefix(prefix: &str) -> bool {
    matches!(prefix, "m vac_1" | "m vac_2" | "m vac_3" | "m vac_4")
}

fn decode_gauge(msg: &str) -> Result<HippoMessage> {
    let tokens: Vec<&str> = msg.split_whitespace().collect();
    if tokens.len() != 5 {
        return Err(Error::decode(
            SENSOR,
            format!("expected 5 entries, got {}", tokens.len()),
            &tokens,
        ));
    }

    let index = tokens[1]
        .strip_prefix("vac_")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| (1..=GAUGE_COUNT).contains(n))
        .ok_or_else(|| Error::decode(SENSOR, format!("bad gauge name {:?}", tokens[1]), &tokens))?;

    let mut values = [0.0f64; 3];
    for (slot, raw) in values.iter_mut().zip(&tokens[2..]) {
        *slot = raw
            .parse::<f64>()
            .map_err(|e| Error::decode(SENSOR, format!("bad number {:?}: {}", raw, e), &tokens))?;
    }

    Ok(HippoMessage::Gauge {
        index,
        reading: VacuumGaugeReading {
            ionization_gauge: values[0],
            convection_gauge_1: values[1],
            convection_gauge_2: values[2],
        },
    })
}

/// Collects gauge reports until every gauge has reported at least once.
#[derive(Debug, Default)]
pub struct GaugeSlots {
    slots: [Option<VacuumGaugeReading>; GAUGE_COUNT],
}

impl GaugeSlots {
    /// Store a report for gauge `index` (1-based), replacing any earlier one.
    pub fn fill(&mut self, index: usize, reading: VacuumGaugeReading) {
        if let Some(slot) = index.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            *slot = Some(reading);
        }
    }

    /// All four readings in gauge order, emptying the slots, once complete.
    pub fn take_complete(&mut self) -> Option<[VacuumGaugeReading; GAUGE_COUNT]> {
        match self.slots {
            [Some(g1), Some(g2), Some(g3), Some(g4)] => {
                self.slots = Default::default();
                Some([g1, g2, g3, g4])
            }
            _ => None,
        }
    }
}

pub struct HippoReader {
    socket: UdpSocket,
    read_timeout: Duration,
    buf: Vec<u8>,
    slots: GaugeSlots,
}

impl HippoReader {
    pub async fn bind(cfg: &HippoConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&cfg.bind).await?;
        socket.set_broadcast(true)?;
        tracing::info!("HIPPO listening on {}", socket.local_addr()?);
        Ok(HippoReader {
            socket,
            read_timeout: cfg.read_timeout(),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
            slots: GaugeSlots::default(),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait until all four gauges have reported and return their readings
    /// ordered by gauge number. Every call starts from empty slots.
    ///
    /// `read_timeout` bounds the whole call, so pump traffic arriving without
    /// gauge reports still ends in `Error::Timeout`.
    pub async fn read(&mut self) -> Result<[VacuumGaugeReading; GAUGE_COUNT]> {
        self.slots = GaugeSlots::default();
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let (len, _) = timeout_at(deadline, self.socket.recv_from(&mut self.buf))
                .await
                .map_err(|_| Error::Timeout(SENSOR))??;

            let data = std::str::from_utf8(&self.buf[..len])
                .map_err(|e| Error::decode(SENSOR, format!("non-UTF-8 datagram: {}", e), &[]))?;

            match classify(data)? {
                HippoMessage::Gauge { index, reading } => {
                    self.slots.fill(index, reading);
                    if let Some(readings) = self.slots.take_complete() {
                        return Ok(readings);
                    }
                }
                other => tracing::trace!("HIPPO ignoring {:?}", other),
            }
        }
    }
}
