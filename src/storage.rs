use crate::error::{Error, Result};
use crate::sample::{RunHeader, Sample};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const RECORD_FRAME_HEADER: u32 = 0x5052_4543;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum FrameKind {
    Header,
    Sample,
}

/// Per-record metadata and payload framing
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordFrame {
    magic: u32,
    kind: FrameKind,
    payload_len: u32,
    payload_crc32: u32,
}

impl RecordFrame {
    fn new(kind: FrameKind, payload: &[u8]) -> Self {
        RecordFrame {
            magic: RECORD_FRAME_HEADER,
            kind,
            payload_len: payload.len() as u32,
            payload_crc32: crc32fast::hash(payload),
        }
    }

    fn to_bytes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let meta_json = serde_json::to_string(&self).map_err(storage_err)?;
        let mut buf = Vec::with_capacity(8 + meta_json.len() + payload.len());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
        buf.extend_from_slice(meta_json.as_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    fn from_reader(reader: &mut dyn Read) -> Result<Option<(RecordFrame, Vec<u8>)>> {
        let mut magic_buf = [0u8; 4];
        if reader.read_exact(&mut magic_buf).is_err() {
            return Ok(None);
        }
        let magic = u32::from_le_bytes(magic_buf);
        if magic != RECORD_FRAME_HEADER {
            return Err(Error::Storage(format!("bad frame magic {:#010x}", magic)));
        }

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let meta_len = u32::from_le_bytes(len_buf) as usize;

        let mut meta_buf = vec![0u8; meta_len];
        reader.read_exact(&mut meta_buf)?;
        let frame: RecordFrame = serde_json::from_slice(&meta_buf).map_err(storage_err)?;

        let mut payload = vec![0u8; frame.payload_len as usize];
        reader.read_exact(&mut payload)?;

        let crc = crc32fast::hash(&payload);
        if crc != frame.payload_crc32 {
            return Err(Error::Storage(format!(
                "payload CRC mismatch: expected {}, got {}",
                frame.payload_crc32, crc
            )));
        }

        Ok(Some((frame, payload)))
    }
}

fn storage_err(e: serde_json::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Summary written next to a run file once it is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_number: u32,
    pub file: PathBuf,
    pub samples: u64,
    pub sha256: String,
    pub closed_at: DateTime<Local>,
}

pub fn run_file_name(run_number: u32) -> String {
    format!("pressures_run-{:04}.log", run_number)
}

pub fn manifest_path(run_file: &Path) -> PathBuf {
    let mut name = run_file.file_name().unwrap_or_default().to_os_string();
    name.push(".manifest.json");
    run_file.with_file_name(name)
}

/// Append-only output file for one run: a header frame followed by one frame per sample.
pub struct RunWriter {
    run_number: u32,
    path: PathBuf,
    file: BufWriter<File>,
    samples_written: u64,
}

impl RunWriter {
    /// Create (or truncate) the run's file in `dir` and write its header.
    pub async fn create(dir: &Path, header: &RunHeader) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(run_file_name(header.run_number));
        let file = File::create(&path).await?;

        let mut writer = RunWriter {
            run_number: header.run_number,
            path,
            file: BufWriter::new(file),
            samples_written: 0,
        };
        let payload = serde_json::to_vec(header).map_err(storage_err)?;
        writer.write_frame(FrameKind::Header, &payload).await?;
        tracing::info!("opened run file {}", writer.path.display());
        Ok(writer)
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub async fn append(&mut self, sample: &Sample) -> Result<()> {
        let payload = serde_json::to_vec(sample).map_err(storage_err)?;
        self.write_frame(FrameKind::Sample, &payload).await?;
        self.samples_written += 1;
        Ok(())
    }

    async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        let frame_data = RecordFrame::new(kind, payload).to_bytes(payload)?;
        self.file.write_all(&frame_data).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Flush, sync and checksum the file. Consumes the writer.
    pub async fn close(mut self) -> Result<RunManifest> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;
        drop(self.file);

        let manifest = RunManifest {
            run_number: self.run_number,
            file: self.path.clone(),
            samples: self.samples_written,
            sha256: file_checksum(&self.path).await?,
            closed_at: Local::now(),
        };

        let path = manifest_path(&self.path);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&manifest).map_err(storage_err)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::info!(
            "closed run file {} ({} samples)",
            self.path.display(),
            self.samples_written
        );
        Ok(manifest)
    }
}

pub async fn file_checksum(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read a run file back.
pub async fn replay(path: &Path) -> Result<(RunHeader, Vec<Sample>)> {
    let data = tokio::fs::read(path).await?;
    let mut reader: &[u8] = &data;

    let header = match RecordFrame::from_reader(&mut reader)? {
        Some((frame, payload)) if frame.kind == FrameKind::Header => {
            serde_json::from_slice::<RunHeader>(&payload).map_err(storage_err)?
        }
        _ => return Err(Error::Storage(format!("{} has no run header", path.display()))),
    };

    let mut samples = Vec::new();
    while let Some((frame, payload)) = RecordFrame::from_reader(&mut reader)? {
        if frame.kind != FrameKind::Sample {
            return Err(Error::Storage("unexpected header frame after samples".to_string()));
        }
        samples.push(serde_json::from_slice(&payload).map_err(storage_err)?);
    }
    Ok((header, samples))
}
