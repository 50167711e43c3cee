use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Number of HIPPO vacuum gauges, indexed 1..=4 on the wire.
pub const GAUGE_COUNT: usize = 4;

/// One HIPPO gauge report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VacuumGaugeReading {
    pub ionization_gauge: f64,
    pub convection_gauge_1: f64,
    pub convection_gauge_2: f64,
}

impl VacuumGaugeReading {
    pub fn channels(&self) -> [f64; 3] {
        [self.ionization_gauge, self.convection_gauge_1, self.convection_gauge_2]
    }
}

/// One sampling cycle's worth of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub baratron_pressure: f64,
    /// Gauge 1 first.
    pub hippo_readings: [VacuumGaugeReading; GAUGE_COUNT],
}

impl Sample {
    pub fn new(
        timestamp: DateTime<Local>,
        baratron_pressure: f64,
        hippo_readings: [VacuumGaugeReading; GAUGE_COUNT],
    ) -> Self {
        Sample { timestamp, baratron_pressure, hippo_readings }
    }

    /// Gauge channel values as a 4x3 matrix, rows ordered by gauge index.
    pub fn hippo_matrix(&self) -> [[f64; 3]; GAUGE_COUNT] {
        self.hippo_readings.map(|r| r.channels())
    }
}

/// Wall-clock reading of one machine, labelled with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineTime {
    pub machine: String,
    pub time: DateTime<Local>,
}

/// Metadata written at the head of every run file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_number: u32,
    pub remote_clock: Option<MachineTime>,
    pub local_clock: MachineTime,
}
