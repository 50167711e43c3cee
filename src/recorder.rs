use crate::baratron::BaratronReader;
use crate::config::AppConfig;
use crate::diagnostics;
use crate::error::{Error, Result};
use crate::hippo::HippoReader;
use crate::retry::RetryPolicy;
use crate::sample::{RunHeader, Sample};
use crate::storage::{RunManifest, RunWriter};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// What a finished sampling task reports back.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub run_number: u32,
    pub samples: u64,
    /// Absent if the run file could not be closed cleanly.
    pub manifest: Option<RunManifest>,
    /// Set when sampling stopped on an error rather than on request.
    pub aborted: Option<String>,
}

/// The run file, shared between the sampling task and its session handle so
/// it can still be closed after the task is aborted.
type SharedSink = Arc<Mutex<Option<RunWriter>>>;

/// One run's background sampling task.
pub struct RecordingSession {
    run_number: u32,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<SessionSummary>,
    sink: SharedSink,
}

impl RecordingSession {
    /// Open both instruments and the run file, then start sampling.
    /// Anything opened before a failure is dropped, closing its socket.
    async fn start(run_number: u32, cfg: &AppConfig) -> Result<Self> {
        let clock = diagnostics::take_snapshot(&cfg.clock).await;
        let baratron = BaratronReader::connect(&cfg.baratron).await?;
        let hippo = HippoReader::bind(&cfg.hippo).await?;

        let header = RunHeader {
            run_number,
            remote_clock: clock.remote,
            local_clock: clock.local,
        };
        let writer = RunWriter::create(&cfg.session.output_dir, &header).await?;
        let sink: SharedSink = Arc::new(Mutex::new(Some(writer)));

        let sampler = Sampler {
            run_number,
            baratron,
            hippo,
            sink: sink.clone(),
            interval: cfg.session.sample_interval(),
            retry: RetryPolicy::from(&cfg.retry),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(stop_rx));

        Ok(RecordingSession { run_number, stop_tx, handle, sink })
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// True once the sampling task has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it to close its resources. If it does not
    /// finish within `join_timeout` it is aborted and the run file is closed
    /// here instead.
    async fn stop(self, join_timeout: Duration) -> SessionSummary {
        let RecordingSession { run_number, stop_tx, mut handle, sink } = self;
        // Fails only when the task already exited and dropped its receiver.
        let _ = stop_tx.send(true);

        let reason = match timeout(join_timeout, &mut handle).await {
            Ok(Ok(summary)) => return summary,
            Ok(Err(e)) => format!("sampling task failed: {}", e),
            Err(_) => {
                handle.abort();
                // Let the cancelled task release the sink lock.
                let _ = handle.await;
                format!("sampling did not stop within {:?}", join_timeout)
            }
        };
        tracing::error!("run {}: {}", run_number, reason);

        let (samples, manifest) = close_sink(run_number, &sink).await;
        SessionSummary { run_number, samples, manifest, aborted: Some(reason) }
    }
}

/// Close the run file if nobody has yet. Returns the sample count and the
/// manifest when the close succeeded.
async fn close_sink(run_number: u32, sink: &Mutex<Option<RunWriter>>) -> (u64, Option<RunManifest>) {
    let Some(writer) = sink.lock().await.take() else {
        tracing::warn!("run {}: run file was already closed", run_number);
        return (0, None);
    };

    let samples = writer.samples_written();
    match writer.close().await {
        Ok(manifest) => (samples, Some(manifest)),
        Err(e) => {
            tracing::error!("run {}: failed to close run file: {}", run_number, e);
            (samples, None)
        }
    }
}

struct Sampler {
    run_number: u32,
    baratron: BaratronReader,
    hippo: HippoReader,
    sink: SharedSink,
    interval: Duration,
    retry: RetryPolicy,
}

impl Sampler {
    async fn run(mut self, mut stop: watch::Receiver<bool>) -> SessionSummary {
        tracing::info!("run {}: sampling every {:?}", self.run_number, self.interval);

        let aborted = match self.sample_until_stopped(&mut stop).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("run {}: sampling aborted: {}", self.run_number, e);
                Some(e.to_string())
            }
        };

        let Sampler { run_number, baratron, hippo, sink, .. } = self;
        drop(baratron);
        drop(hippo);

        let (samples, manifest) = close_sink(run_number, &sink).await;
        tracing::info!("run {}: sampling stopped after {} samples", run_number, samples);
        SessionSummary { run_number, samples, manifest, aborted }
    }

    async fn sample_until_stopped(&mut self, stop: &mut watch::Receiver<bool>) -> Result<()> {
        while !*stop.borrow() {
            let sample = self.sample_once().await?;
            self.sink
                .lock()
                .await
                .as_mut()
                .ok_or_else(|| Error::Storage("run file already closed".to_string()))?
                .append(&sample)
                .await?;
            tracing::debug!(
                "run {}: baratron={} hippo={:?}",
                self.run_number,
                sample.baratron_pressure,
                sample.hippo_matrix()
            );

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        tracing::warn!("run {}: session handle dropped, stopping", self.run_number);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn sample_once(&mut self) -> Result<Sample> {
        let timestamp = Local::now();

        let baratron_pressure = self
            .retry
            .run(
                &mut self.baratron,
                "Baratron read",
                |b| Box::pin(b.read()),
                |b| Box::pin(b.reconnect()),
            )
            .await?;

        let hippo_readings = self
            .retry
            .run(
                &mut self.hippo,
                "HIPPO read",
                |h| Box::pin(h.read()),
                |_| Box::pin(async { Ok(()) }),
            )
            .await?;

        Ok(Sample::new(timestamp, baratron_pressure, hippo_readings))
    }
}

/// Process-wide registry holding at most one running session.
pub struct SessionController {
    config: Arc<AppConfig>,
    active: Mutex<Option<RecordingSession>>,
}

impl SessionController {
    pub fn new(config: Arc<AppConfig>) -> Self {
        SessionController { config, active: Mutex::new(None) }
    }

    pub async fn active_run(&self) -> Option<u32> {
        self.active.lock().await.as_ref().map(|s| s.run_number())
    }

    pub async fn begin(&self, run_number: u32) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(session) = active.as_ref() {
            if !session.is_finished() {
                return Err(Error::SessionAlreadyActive { run_number: session.run_number() });
            }
        }
        if let Some(dead) = active.take() {
            let summary = dead.stop(self.config.session.join_timeout()).await;
            tracing::warn!(
                "run {}: reaped ended session ({} samples, aborted: {:?})",
                summary.run_number,
                summary.samples,
                summary.aborted
            );
        }

        let session = RecordingSession::start(run_number, &self.config).await?;
        *active = Some(session);
        tracing::info!("run {}: recording", run_number);
        Ok(())
    }

    pub async fn end(&self, run_number: u32) -> Result<SessionSummary> {
        let mut active = self.active.lock().await;

        let session = match active.take() {
            Some(session) if session.run_number() == run_number => session,
            Some(session) => {
                let expected = session.run_number();
                *active = Some(session);
                return Err(Error::RunNumberMismatch { expected, actual: run_number });
            }
            None => return Err(Error::NoActiveSession),
        };

        let summary = session.stop(self.config.session.join_timeout()).await;
        tracing::info!("run {}: ended with {} samples", run_number, summary.samples);
        Ok(summary)
    }

    /// Stop whatever is running. Used on process shutdown.
    pub async fn shutdown(&self) -> Option<SessionSummary> {
        let session = self.active.lock().await.take()?;
        tracing::info!("run {}: stopping for shutdown", session.run_number());
        Some(session.stop(self.config.session.join_timeout()).await)
    }
}
