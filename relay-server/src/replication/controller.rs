//! Reader Controller - starts and stops the stream reader with leadership
//!
//! Every start/stop request goes through one command queue consumed by a
//! single task, so rapid leadership flaps are applied one at a time and at
//! most one reader runs per node. A reader is discarded once stopped; the
//! next term gets a fresh one from the factory.

use super::config::ReaderConfig;
use super::pipeline::EventPipeline;
use super::reader::{ReaderSink, StreamReader, StreamReaderFactory};
use super::types::{ReaderStatus, ReplicationResult};
use crate::cluster::LeadershipObserver;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum ReaderCommand {
    Start,
    Stop,
    Shutdown(oneshot::Sender<()>),
}

pub struct ReaderController {
    tx: mpsc::UnboundedSender<ReaderCommand>,
    status: Arc<RwLock<ReaderStatus>>,
}

impl ReaderController {
    /// Spawn the control task
    ///
    /// `initial` is the reader opened at startup; later terms use `factory`.
    pub fn spawn(
        factory: Arc<dyn StreamReaderFactory>,
        initial: Option<Arc<dyn StreamReader>>,
        pipeline: Arc<EventPipeline>,
        config: &ReaderConfig,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(ReaderStatus::Stopped));

        let task = ControlTask {
            rx,
            factory,
            pipeline,
            status: Arc::clone(&status),
            spare: initial,
            active: None,
            want_running: false,
            retry_at: None,
            retry_interval: config.retry_interval(),
            stop_timeout: config.stop_timeout(),
        };
        tokio::spawn(task.run(shutdown.clone()));

        Arc::new(Self { tx, status })
    }

    pub fn start(&self) {
        self.send(ReaderCommand::Start);
    }

    pub fn stop(&self) {
        self.send(ReaderCommand::Stop);
    }

    pub fn status(&self) -> ReaderStatus {
        *self.status.read()
    }

    /// Stop the reader and end the control task, waiting for both
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(ReaderCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn send(&self, command: ReaderCommand) {
        if self.tx.send(command).is_err() {
            debug!("Reader controller already stopped");
        }
    }
}

impl LeadershipObserver for ReaderController {
    fn on_leadership_change(&self, is_leader: bool) {
        if is_leader {
            self.start();
        } else {
            self.stop();
        }
    }
}

struct ActiveReader {
    reader: Arc<dyn StreamReader>,
    handle: JoinHandle<ReplicationResult<()>>,
}

enum ControlEvent {
    Command(ReaderCommand),
    Exited(Result<ReplicationResult<()>, JoinError>),
    Retry,
}

struct ControlTask {
    rx: mpsc::UnboundedReceiver<ReaderCommand>,
    factory: Arc<dyn StreamReaderFactory>,
    pipeline: Arc<EventPipeline>,
    status: Arc<RwLock<ReaderStatus>>,
    /// Unused reader ready for the next start
    spare: Option<Arc<dyn StreamReader>>,
    active: Option<ActiveReader>,
    want_running: bool,
    retry_at: Option<Instant>,
    retry_interval: Duration,
    stop_timeout: Duration,
}

impl ControlTask {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => ControlEvent::Command(command),
                    None => break,
                },
                result = wait_active(&mut self.active) => ControlEvent::Exited(result),
                _ = sleep_until(self.retry_at) => ControlEvent::Retry,
            };

            match event {
                ControlEvent::Command(ReaderCommand::Start) => {
                    self.want_running = true;
                    self.retry_at = None;
                    self.start_reader().await;
                }
                ControlEvent::Command(ReaderCommand::Stop) => {
                    self.want_running = false;
                    self.retry_at = None;
                    self.stop_reader().await;
                }
                ControlEvent::Command(ReaderCommand::Shutdown(done)) => {
                    self.want_running = false;
                    self.stop_reader().await;
                    let _ = done.send(());
                    return;
                }
                ControlEvent::Exited(result) => {
                    self.active = None;
                    *self.status.write() = ReaderStatus::Stopped;
                    match result {
                        Ok(Ok(())) => warn!("Stream reader ended"),
                        Ok(Err(e)) => error!("Stream reader failed: {}", e),
                        Err(e) => error!("Stream reader task failed: {}", e),
                    }
                    if self.want_running {
                        self.retry_at = Some(Instant::now() + self.retry_interval);
                    }
                }
                ControlEvent::Retry => {
                    self.retry_at = None;
                    if self.want_running {
                        self.start_reader().await;
                    }
                }
            }
        }

        self.stop_reader().await;
        debug!("Reader controller stopped");
    }

    async fn start_reader(&mut self) {
        if self.active.is_some() {
            debug!("Stream reader already running");
            return;
        }

        let reader = match self.spare.take() {
            Some(reader) => reader,
            None => match self.factory.create() {
                Ok(reader) => reader,
                Err(e) => {
                    error!("Cannot create stream reader: {}", e);
                    self.retry_at = Some(Instant::now() + self.retry_interval);
                    return;
                }
            },
        };

        let start = self.pipeline.prepare_resume().await.map(|c| c.position());
        match &start {
            Some(position) => info!(
                "Starting stream reader at {}:{}",
                position.file_name, position.offset
            ),
            None => info!("Starting stream reader from the beginning"),
        }

        let sink: Arc<dyn ReaderSink> = self.pipeline.clone();
        let task_reader = Arc::clone(&reader);
        let handle = tokio::spawn(async move { task_reader.run_from(start, sink).await });

        self.active = Some(ActiveReader { reader, handle });
        *self.status.write() = ReaderStatus::Running;
    }

    async fn stop_reader(&mut self) {
        let Some(ActiveReader { reader, mut handle }) = self.active.take() else {
            return;
        };
        reader.close();

        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => info!("Stream reader stopped"),
            Ok(Ok(Err(e))) => warn!("Stream reader stopped with error: {}", e),
            Ok(Err(e)) => error!("Stream reader task failed: {}", e),
            Err(_) => {
                warn!(
                    "Stream reader did not stop within {:?}, aborting",
                    self.stop_timeout
                );
                handle.abort();
            }
        }
        *self.status.write() = ReaderStatus::Stopped;
    }
}

async fn wait_active(
    active: &mut Option<ActiveReader>,
) -> Result<ReplicationResult<()>, JoinError> {
    match active {
        Some(active) => (&mut active.handle).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
