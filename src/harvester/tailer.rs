// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use super::HarvesterConfig;
use super::reader::{LineReader, ReadOutcome};
use super::state::{Directive, HarvesterState, HarvesterStatus};
use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::error::Result;
use crate::event::{AckRoute, Acknowledgement, Event};
use crate::publisher::Publisher;
use crate::registry::{CommitOutcome, FileId, Fingerprint, ReadState, Registry};

/// Owner side of a harvester: directives in, status out.
#[derive(Debug)]
pub struct HarvesterControl {
    pub directives: watch::Sender<Directive>,
    pub status: watch::Receiver<HarvesterStatus>,
}

/// Tails one file and publishes its lines.
pub struct Harvester {
    path: PathBuf,
    expected: Option<FileId>,
    config: HarvesterConfig,
    registry: Arc<Registry>,
    publisher: Publisher,
    directives: watch::Receiver<Directive>,
    status: watch::Sender<HarvesterStatus>,
}

impl Harvester {
    /// `expected` is the identity seen at discovery. If the file at `path`
    /// turns out to be another one by the time it is opened, the opened
    /// handle wins.
    pub fn new(
        path: impl AsRef<Path>,
        expected: Option<FileId>,
        config: HarvesterConfig,
        registry: Arc<Registry>,
        publisher: Publisher,
    ) -> (Self, HarvesterControl) {
        let path = path.as_ref().to_path_buf();
        let (directive_tx, directive_rx) = watch::channel(Directive::Run);
        let (status_tx, status_rx) =
            watch::channel(HarvesterStatus::starting(path.clone(), expected));

        let harvester = Self {
            path,
            expected,
            config,
            registry,
            publisher,
            directives: directive_rx,
            status: status_tx,
        };
        let control = HarvesterControl {
            directives: directive_tx,
            status: status_rx,
        };
        (harvester, control)
    }

    pub async fn run(self) -> HarvesterStatus {
        let Harvester {
            path,
            expected,
            config,
            registry,
            publisher,
            directives,
            status,
        } = self;

        let control = Control::new(directives);
        let (ack_tx, ack_rx) = bounded(config.ack_capacity.max(1));

        let open_path = path.clone();
        let read_buffer = config.read_buffer_bytes;
        let max_line = config.max_line_bytes;
        let opened = blocking(move || {
            let reader = LineReader::open(open_path, read_buffer, max_line)?;
            let head = reader.fingerprint()?;
            Ok((reader, head))
        })
        .await;

        let (mut reader, head) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = ?path, error = %e, "Unable to open file for harvesting");
                return finish_status(&status, HarvesterState::Failed);
            }
        };

        let identity = reader.identity();
        if let Some(expected) = expected {
            if expected != identity {
                debug!(
                    path = ?path,
                    %expected,
                    actual = %identity,
                    "File changed between discovery and open, following the opened handle"
                );
            }
        }

        let begin_registry = registry.clone();
        let begin_path = path.clone();
        let resume = match blocking(move || begin_registry.begin(identity, &begin_path, &head)).await
        {
            Ok(state) => state,
            Err(e) => {
                error!(path = ?path, %identity, error = %e, "Unable to load read state");
                return finish_status(&status, HarvesterState::Failed);
            }
        };

        reader.seek(resume.offset);
        let reader = Arc::new(Mutex::new(reader));
        let tail = Tail::new(
            path.clone(),
            identity,
            &resume,
            registry,
            reader.clone(),
            status,
            ack_tx,
        );
        info!(
            path = ?path,
            %identity,
            offset = resume.offset,
            generation = resume.generation,
            "Harvester started"
        );

        let mut run = Run {
            config,
            publisher,
            reader,
            tail,
            control,
            ack_rx,
        };
        run.check_now().await;
        run.tail.set_state(HarvesterState::Reading);
        run.harvest().await
    }
}

fn finish_status(status: &watch::Sender<HarvesterStatus>, state: HarvesterState) -> HarvesterStatus {
    status.send_modify(|s| s.state = state);
    status.borrow().clone()
}

/// Run a blocking closure on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn lock(reader: &Mutex<LineReader>) -> MutexGuard<'_, LineReader> {
    // A panic mid-read leaves the reader usable: positions only move after a
    // successful read.
    reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Directive receiver that only ever escalates and tolerates a dropped owner.
struct Control {
    rx: watch::Receiver<Directive>,
    current: Directive,
    closed: bool,
}

impl Control {
    fn new(mut rx: watch::Receiver<Directive>) -> Self {
        let current = *rx.borrow_and_update();
        Self {
            rx,
            current,
            closed: false,
        }
    }

    fn current(&self) -> Directive {
        self.current
    }

    /// Resolves on the next directive change. Never resolves once the owner
    /// is gone; a vanished owner counts as `Finish`.
    async fn changed(&mut self) -> Directive {
        if self.closed {
            return std::future::pending().await;
        }
        match self.rx.changed().await {
            Ok(()) => {
                let next = *self.rx.borrow_and_update();
                self.current = self.current.max(next);
            }
            Err(_) => {
                self.closed = true;
                self.current = self.current.max(Directive::Finish);
            }
        }
        self.current
    }
}

/// Per-file progress: what has been handed off and what has been committed.
struct Tail {
    path: PathBuf,
    source_path: Arc<PathBuf>,
    identity: FileId,
    generation: u64,
    epoch: u64,
    /// Committed offset in the current generation
    committed: u64,
    /// End of the last event handed to the pipeline
    submitted: u64,
    /// Set by a nack: resume at `committed`
    rewind: bool,
    rotated: bool,
    /// Stored fingerprint of the current generation
    fingerprint: Fingerprint,
    registry: Arc<Registry>,
    reader: Arc<Mutex<LineReader>>,
    status: watch::Sender<HarvesterStatus>,
    ack_tx: BoundedSender<Acknowledgement>,
}

impl Tail {
    fn new(
        path: PathBuf,
        identity: FileId,
        resume: &ReadState,
        registry: Arc<Registry>,
        reader: Arc<Mutex<LineReader>>,
        status: watch::Sender<HarvesterStatus>,
        ack_tx: BoundedSender<Acknowledgement>,
    ) -> Self {
        let tail = Self {
            source_path: Arc::new(path.clone()),
            path,
            identity,
            generation: resume.generation,
            epoch: 0,
            committed: resume.offset,
            submitted: resume.offset,
            rewind: false,
            rotated: false,
            fingerprint: resume.fingerprint.clone(),
            registry,
            reader,
            status,
            ack_tx,
        };
        tail.report(HarvesterState::Starting);
        tail
    }

    fn report(&self, state: HarvesterState) {
        self.status.send_replace(HarvesterStatus {
            path: self.path.clone(),
            identity: Some(self.identity),
            state,
            generation: self.generation,
            committed_offset: self.committed,
        });
    }

    fn set_state(&self, state: HarvesterState) {
        self.report(state);
    }

    fn state(&self) -> HarvesterState {
        self.status.borrow().state
    }

    fn outstanding(&self) -> bool {
        self.submitted > self.committed
    }

    fn route(&self) -> AckRoute {
        AckRoute::new(self.ack_tx.clone(), self.epoch)
    }

    async fn on_ack(&mut self, ack: Acknowledgement) {
        match ack {
            Acknowledgement::Ack {
                generation,
                epoch,
                end_offset,
                line_terminated,
            } => {
                if generation != self.generation || epoch != self.epoch {
                    debug!(path = ?self.path, ?ack, "Ignoring acknowledgment for superseded reads");
                    return;
                }
                if end_offset <= self.committed {
                    return;
                }

                let registry = self.registry.clone();
                let identity = self.identity;
                let outcome = blocking(move || {
                    registry.commit(identity, generation, end_offset, line_terminated)
                })
                .await;

                match outcome {
                    Ok(CommitOutcome::Committed) => {
                        self.committed = end_offset;
                        self.report(self.state());
                        if !self.fingerprint.is_complete()
                            && (self.fingerprint.len() as u64) < end_offset
                        {
                            self.refresh_fingerprint().await;
                        }
                    }
                    Ok(CommitOutcome::Stale { current_generation }) => {
                        debug!(
                            path = ?self.path,
                            generation,
                            current_generation,
                            "Commit rejected as stale"
                        );
                    }
                    Err(e) => {
                        // The next acknowledgment carries a higher offset and
                        // retries the write.
                        error!(path = ?self.path, error = %e, "Failed to commit offset");
                    }
                }
            }
            Acknowledgement::Nack {
                generation,
                epoch,
                from_offset,
            } => {
                if generation != self.generation || epoch != self.epoch {
                    return;
                }
                self.epoch += 1;
                self.rewind = true;
                warn!(
                    path = ?self.path,
                    from_offset,
                    committed = self.committed,
                    "Delivery failed permanently, re-reading from last committed offset"
                );
            }
        }
    }

    /// Store more leading bytes once the committed range covers them, so a
    /// file that started short is still recognised after a restart.
    async fn refresh_fingerprint(&mut self) {
        let reader = self.reader.clone();
        let registry = self.registry.clone();
        let identity = self.identity;
        let generation = self.generation;
        let refreshed = blocking(move || {
            let head = lock(&reader).fingerprint()?;
            registry.extend_fingerprint(identity, generation, &head)
        })
        .await;

        match refreshed {
            Ok(stored) => self.fingerprint = stored,
            Err(e) => debug!(path = ?self.path, error = %e, "Unable to refresh fingerprint"),
        }
    }
}

enum Handoff {
    Sent,
    Rewind,
    Abort,
    Closed,
}

enum Check {
    Unchanged,
    Truncated,
    Rotated,
}

struct Run {
    config: HarvesterConfig,
    publisher: Publisher,
    /// Shared with the blocking pool for reads and stats
    reader: Arc<Mutex<LineReader>>,
    tail: Tail,
    control: Control,
    ack_rx: BoundedReceiver<Acknowledgement>,
}

impl Run {
    async fn harvest(mut self) -> HarvesterStatus {
        loop {
            let keep_reading = self.read_phase().await;
            if !keep_reading {
                break;
            }

            self.await_acks().await;

            // A nack while draining an old handle goes back for the lost lines.
            if self.tail.rewind && self.control.current() < Directive::Finish {
                continue;
            }
            break;
        }

        info!(
            path = ?self.tail.path,
            identity = %self.tail.identity,
            committed = self.tail.committed,
            generation = self.tail.generation,
            "Harvester stopped"
        );
        self.tail.set_state(HarvesterState::Stopped);
        self.tail.status.borrow().clone()
    }

    /// Read until the file is done or the harvester is told to stop.
    /// Returns false when the harvester must exit without waiting for acks.
    async fn read_phase(&mut self) -> bool {
        let mut idle = self.config.backoff;
        let mut last_check = Instant::now();

        loop {
            match self.control.current() {
                Directive::Abort => return false,
                Directive::Finish => return true,
                Directive::Run | Directive::Drain => {}
            }

            if self.tail.rewind {
                self.tail.rewind = false;
                self.tail.submitted = self.tail.committed;
                let committed = self.tail.committed;
                lock(&self.reader).seek(committed);
            }

            if last_check.elapsed() >= self.config.check_interval {
                last_check = Instant::now();
                self.check_now().await;
            }

            let outcome = match self.read().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(path = ?self.tail.path, error = %e, delay = ?idle, "Read failed, will retry");
                    if !self.pause(idle).await {
                        return false;
                    }
                    idle = (idle * 2).min(self.config.max_backoff);
                    continue;
                }
            };

            let had_lines = !outcome.lines.is_empty();
            for line in outcome.lines {
                let end = line.range.end;
                let event = Event::line(
                    self.tail.identity,
                    self.tail.source_path.clone(),
                    self.tail.generation,
                    line.range,
                    line.payload,
                    line.terminated,
                    self.tail.route(),
                );

                match self.hand_off(event).await {
                    Handoff::Sent => self.tail.submitted = end,
                    Handoff::Rewind => break,
                    Handoff::Abort => return false,
                    Handoff::Closed => {
                        debug!(path = ?self.tail.path, "Pipeline closed, stopping harvester");
                        return false;
                    }
                }

                if self.control.current() >= Directive::Finish {
                    break;
                }
            }

            if !outcome.eof || had_lines || self.tail.rewind {
                idle = self.config.backoff;
                continue;
            }

            if self.tail.rotated || self.control.current() == Directive::Drain {
                return true;
            }

            last_check = Instant::now();
            self.check_now().await;
            if self.tail.rotated {
                // Pick up anything written before the rename.
                continue;
            }

            if !self.pause(idle).await {
                return false;
            }
            idle = (idle * 2).min(self.config.max_backoff);
        }
    }

    async fn read(&self) -> Result<ReadOutcome> {
        let reader = self.reader.clone();
        blocking(move || Ok(lock(&reader).read_lines()?)).await
    }

    /// Hand one event to the pipeline, serving acknowledgments while the
    /// ingress is full.
    async fn hand_off(&mut self, event: Event) -> Handoff {
        let publisher = self.publisher.clone();
        let send = publisher.publish(event);
        tokio::pin!(send);

        loop {
            select! {
                biased;

                res = &mut send => {
                    return match res {
                        Ok(()) => Handoff::Sent,
                        Err(_) => Handoff::Closed,
                    };
                }

                Some(ack) = self.ack_rx.next() => {
                    self.tail.on_ack(ack).await;
                    if self.tail.rewind {
                        return Handoff::Rewind;
                    }
                }

                directive = self.control.changed() => {
                    if directive == Directive::Abort {
                        return Handoff::Abort;
                    }
                }
            }
        }
    }

    /// Sleep while serving acknowledgments and directives. Returns false
    /// on `Abort`.
    async fn pause(&mut self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            select! {
                _ = sleep_until(until) => return true,

                Some(ack) = self.ack_rx.next() => {
                    self.tail.on_ack(ack).await;
                    if self.tail.rewind {
                        return true;
                    }
                }

                directive = self.control.changed() => {
                    return directive != Directive::Abort;
                }
            }
        }
    }

    /// Wait up to `close_timeout` for outstanding acknowledgments.
    async fn await_acks(&mut self) {
        let deadline = Instant::now() + self.config.close_timeout;

        while self.tail.outstanding() && !self.tail.rewind {
            select! {
                _ = sleep_until(deadline) => {
                    debug!(
                        path = ?self.tail.path,
                        committed = self.tail.committed,
                        submitted = self.tail.submitted,
                        "Close timeout reached with unacknowledged events"
                    );
                    return;
                }

                Some(ack) = self.ack_rx.next() => self.tail.on_ack(ack).await,

                directive = self.control.changed() => {
                    if directive == Directive::Abort {
                        return;
                    }
                }
            }
        }
    }

    /// Compare the open handle with the file system: a handle smaller than
    /// the read position means truncation, a different file (or none) at
    /// the path means rotation.
    async fn check_now(&mut self) {
        let reader = self.reader.clone();
        let path = self.tail.path.clone();
        let checked = blocking(move || {
            let reader = lock(&reader);
            Ok((reader.size(), reader.position(), FileId::from_path(&path)))
        })
        .await;

        let (size, position, at_path) = match checked {
            Ok(v) => v,
            Err(e) => {
                error!(path = ?self.tail.path, error = %e, "File check task failed");
                return;
            }
        };

        let check = match (size, at_path) {
            (Ok(size), _) if size < position => Check::Truncated,
            (_, Ok(id)) if id != self.tail.identity => Check::Rotated,
            (_, Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Check::Rotated,
            (Err(e), _) => {
                debug!(path = ?self.tail.path, error = %e, "Unable to stat open handle");
                Check::Unchanged
            }
            _ => Check::Unchanged,
        };

        match check {
            Check::Unchanged => {}
            Check::Truncated => self.truncate().await,
            Check::Rotated if !self.tail.rotated => {
                info!(
                    path = ?self.tail.path,
                    identity = %self.tail.identity,
                    "File rotated, reading remaining lines from the old handle"
                );
                self.tail.rotated = true;
                self.tail.set_state(HarvesterState::Rotated);
            }
            Check::Rotated => {}
        }
    }

    async fn truncate(&mut self) {
        let registry = self.tail.registry.clone();
        let identity = self.tail.identity;
        let observed = self.tail.generation;

        let state = match blocking(move || registry.advance_generation(identity, observed)).await {
            Ok(state) => state,
            Err(e) => {
                error!(path = ?self.tail.path, error = %e, "Failed to record truncation, will retry");
                return;
            }
        };

        info!(
            path = ?self.tail.path,
            %identity,
            generation = state.generation,
            "File truncated, restarting from the beginning"
        );

        self.tail.generation = state.generation;
        self.tail.fingerprint = state.fingerprint;
        self.tail.committed = 0;
        self.tail.submitted = 0;
        self.tail.rewind = false;
        lock(&self.reader).seek(0);
        self.tail.set_state(HarvesterState::Truncated);
        self.tail.set_state(if self.tail.rotated {
            HarvesterState::Rotated
        } else {
            HarvesterState::Reading
        });
    }
}
