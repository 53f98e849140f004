// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::select;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::{Batch, BatchBuilder};
use super::retry::RetryConfig;
use super::sink::{Sink, SinkError};
use crate::bounded_channel::{BoundedReceiver, BoundedSender, TrySendError, bounded};
use crate::error::{BoxError, Error, Result};
use crate::event::{AckRoute, Acknowledgement, Event};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_events: usize,
    pub max_bytes: usize,
    pub max_linger: Duration,
    /// Capacity of the bounded ingress shared by every producer
    pub ingress_capacity: usize,
    pub retry: RetryConfig,
    /// How long delivery continues after cancellation
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_events: 2048,
            max_bytes: 4 * 1024 * 1024,
            max_linger: Duration::from_secs(1),
            ingress_capacity: 4096,
            retry: RetryConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(Error::Config("batch max events must be at least 1".into()));
        }
        if self.max_bytes == 0 {
            return Err(Error::Config("batch max bytes must be at least 1".into()));
        }
        if self.ingress_capacity == 0 {
            return Err(Error::Config("ingress capacity must be at least 1".into()));
        }
        self.retry.validate()
    }
}

/// Counters kept by the pipeline. They feed logs and tests only.
#[derive(Debug, Default)]
pub struct PipelineStats {
    accepting: AtomicBool,
    events_received: AtomicU64,
    events_delivered: AtomicU64,
    batches_delivered: AtomicU64,
    send_failures: AtomicU64,
    permanent_failures: AtomicU64,
    events_abandoned: AtomicU64,
}

/// Plain copy of [`PipelineStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub events_received: u64,
    pub events_delivered: u64,
    pub batches_delivered: u64,
    pub send_failures: u64,
    pub permanent_failures: u64,
    pub events_abandoned: u64,
}

impl PipelineStats {
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            events_abandoned: self.events_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Why the pipeline refused an event.
#[derive(Debug)]
pub enum Rejected {
    /// Ingress is full; the event is handed back untouched.
    Backpressure(Event),
    Closed,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::Backpressure(_) => write!(f, "pipeline ingress is full"),
            Rejected::Closed => write!(f, "pipeline is closed"),
        }
    }
}

impl std::error::Error for Rejected {}

/// Producer handle onto the pipeline ingress.
#[derive(Clone, Debug)]
pub struct Publisher {
    tx: BoundedSender<Event>,
    stats: Arc<PipelineStats>,
}

impl Publisher {
    /// Hand off without waiting.
    pub fn submit(&self, event: Event) -> std::result::Result<(), Rejected> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) => Err(Rejected::Backpressure(event)),
            Err(TrySendError::Disconnected(_)) => Err(Rejected::Closed),
        }
    }

    /// Hand off, waiting for ingress capacity.
    pub async fn publish(&self, event: Event) -> std::result::Result<(), Rejected> {
        self.tx.send(event).await.map_err(|_| Rejected::Closed)?;
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        self.stats.is_accepting() && !self.tx.is_disconnected()
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}

/// Batches events from every producer and delivers them to a sink from a
/// single loop, so the order of events from one source is kept.
pub struct Pipeline<S: Sink> {
    config: PipelineConfig,
    sink: S,
    rx: BoundedReceiver<Event>,
    stats: Arc<PipelineStats>,
    shutdown_deadline: Option<Instant>,
}

impl<S: Sink> Pipeline<S> {
    pub fn new(config: PipelineConfig, sink: S) -> (Self, Publisher) {
        let (tx, rx) = bounded(config.ingress_capacity.max(1));
        let stats = Arc::new(PipelineStats::default());

        let publisher = Publisher {
            tx,
            stats: stats.clone(),
        };
        let pipeline = Self {
            config,
            sink,
            rx,
            stats,
            shutdown_deadline: None,
        };
        (pipeline, publisher)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) -> std::result::Result<(), BoxError> {
        let mut builder = BatchBuilder::new(
            self.config.max_events,
            self.config.max_bytes,
            self.config.max_linger,
        );

        self.stats.accepting.store(true, Ordering::SeqCst);
        info!(sink = self.sink.name(), "Publisher pipeline started");

        loop {
            let linger = builder.deadline();
            let linger_at = linger.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Publisher pipeline cancelled, draining");
                    break;
                }

                _ = sleep_until(linger_at), if linger.is_some() => {
                    let batch = builder.take();
                    self.deliver(batch, &cancel).await;
                }

                event = self.rx.next() => match event {
                    Some(event) => self.accept(&mut builder, event, &cancel).await,
                    None => {
                        debug!("All publishers closed");
                        break;
                    }
                }
            }
        }

        self.drain(builder, &cancel).await;
        Ok(())
    }

    async fn accept(&mut self, builder: &mut BatchBuilder, event: Event, cancel: &CancellationToken) {
        if let Some(batch) = builder.push(event) {
            self.deliver(batch, cancel).await;
        }
        if builder.is_full() {
            let batch = builder.take();
            self.deliver(batch, cancel).await;
        }
    }

    /// Keep delivering until every producer is gone or the grace period has
    /// passed. Whatever is still queued after that is left for re-reading.
    async fn drain(&mut self, mut builder: BatchBuilder, cancel: &CancellationToken) {
        let deadline = self.begin_shutdown();
        self.stats.accepting.store(false, Ordering::SeqCst);

        loop {
            match timeout_at(deadline, self.rx.next()).await {
                Ok(Some(event)) => self.accept(&mut builder, event, cancel).await,
                Ok(None) => break,
                Err(_) => {
                    warn!("Shutdown grace period elapsed while draining the pipeline");
                    break;
                }
            }
        }

        if !builder.is_empty() {
            let batch = builder.take();
            self.deliver(batch, cancel).await;
        }

        let mut left = 0u64;
        while self.rx.try_recv().is_some() {
            left += 1;
        }
        if left > 0 {
            self.stats.events_abandoned.fetch_add(left, Ordering::Relaxed);
            warn!(
                events = left,
                "Abandoned queued events at shutdown, they will be re-read from the last committed offset"
            );
        }

        let counters = self.stats.snapshot();
        info!(
            delivered = counters.events_delivered,
            batches = counters.batches_delivered,
            permanent_failures = counters.permanent_failures,
            "Publisher pipeline stopped"
        );
    }

    fn begin_shutdown(&mut self) -> Instant {
        *self
            .shutdown_deadline
            .get_or_insert_with(|| Instant::now() + self.config.shutdown_grace)
    }

    async fn deliver(&mut self, batch: Batch, cancel: &CancellationToken) {
        let mut backoff = self.config.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = match self.shutdown_deadline {
                Some(deadline) => timeout_at(deadline, self.sink.send(&batch))
                    .await
                    .unwrap_or(Err(SinkError::Timeout)),
                None => self.sink.send(&batch).await,
            };

            let err = match result {
                Ok(()) => {
                    self.stats
                        .events_delivered
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
                    self.acknowledge(&batch).await;
                    return;
                }
                Err(e) => e,
            };

            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);

            if attempt >= self.config.retry.max_attempts {
                self.stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    sink = self.sink.name(),
                    attempts = attempt,
                    events = batch.len(),
                    error = %err,
                    "Permanent delivery failure, sources will re-read from their last committed offset"
                );
                self.reject(&batch).await;
                return;
            }

            let delay = backoff.next_delay();
            let retry_at = Instant::now() + delay;

            if let Some(deadline) = self.shutdown_deadline {
                if retry_at >= deadline {
                    self.abandon(&batch, &err);
                    return;
                }
            }

            warn!(
                sink = self.sink.name(),
                attempt,
                delay = ?delay,
                error = %err,
                "Sending batch failed, will retry after delay"
            );

            select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled(), if self.shutdown_deadline.is_none() => {
                    let deadline = self.begin_shutdown();
                    if retry_at >= deadline {
                        sleep_until(deadline).await;
                        self.abandon(&batch, &err);
                        return;
                    }
                    sleep_until(retry_at).await;
                }
            }
        }
    }

    fn abandon(&self, batch: &Batch, err: &SinkError) {
        self.stats
            .events_abandoned
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        warn!(
            events = batch.len(),
            error = %err,
            "Abandoning batch at shutdown, it will be re-read from the last committed offset"
        );
    }

    /// One ack per source, generation and epoch, carrying the furthest
    /// offset reached. Sent only after the whole batch was delivered.
    async fn acknowledge(&self, batch: &Batch) {
        for (route, ack) in group_acks(batch) {
            self.notify(&route, ack).await;
        }
    }

    async fn reject(&self, batch: &Batch) {
        for (route, nack) in group_nacks(batch) {
            self.notify(&route, nack).await;
        }
    }

    async fn notify(&self, route: &AckRoute, message: Acknowledgement) {
        let sent = match self.shutdown_deadline {
            Some(deadline) => timeout_at(deadline, route.sender().send(message))
                .await
                .unwrap_or(Ok(())),
            None => route.sender().send(message).await,
        };
        // A harvester that already exited has nothing left to commit.
        if sent.is_err() {
            debug!(?message, "Harvester gone, dropping acknowledgment");
        }
    }
}

fn group_acks(batch: &Batch) -> Vec<(AckRoute, Acknowledgement)> {
    let mut acks: Vec<(AckRoute, Acknowledgement)> = Vec::new();

    for event in batch.events() {
        let Some(route) = event.ack_route() else {
            continue;
        };
        let end = event.offset_range.end;

        let existing = acks.iter_mut().find(|(r, a)| {
            r.same_target(route)
                && matches!(a, Acknowledgement::Ack { generation, .. } if *generation == event.generation)
        });

        match existing {
            Some((
                _,
                Acknowledgement::Ack {
                    end_offset,
                    line_terminated,
                    ..
                },
            )) => {
                if end >= *end_offset {
                    *end_offset = end;
                    *line_terminated = event.line_terminated;
                }
            }
            _ => acks.push((
                route.clone(),
                Acknowledgement::Ack {
                    generation: event.generation,
                    epoch: route.epoch(),
                    end_offset: end,
                    line_terminated: event.line_terminated,
                },
            )),
        }
    }

    acks
}

fn group_nacks(batch: &Batch) -> Vec<(AckRoute, Acknowledgement)> {
    let mut nacks: Vec<(AckRoute, Acknowledgement)> = Vec::new();

    for event in batch.events() {
        let Some(route) = event.ack_route() else {
            continue;
        };
        let start = event.offset_range.start;

        let existing = nacks.iter_mut().find(|(r, a)| {
            r.same_target(route)
                && matches!(a, Acknowledgement::Nack { generation, .. } if *generation == event.generation)
        });

        match existing {
            Some((_, Acknowledgement::Nack { from_offset, .. })) => {
                *from_offset = (*from_offset).min(start);
            }
            _ => nacks.push((
                route.clone(),
                Acknowledgement::Nack {
                    generation: event.generation,
                    epoch: route.epoch(),
                    from_offset: start,
                },
            )),
        }
    }

    nacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::registry::FileId;
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records every batch offered and fails the first `fail_first` sends.
    #[derive(Clone, Default)]
    struct ScriptedSink {
        fail_first: Arc<AtomicU64>,
        offered: Arc<Mutex<Vec<Batch>>>,
    }

    impl ScriptedSink {
        fn failing(n: u64) -> Self {
            Self {
                fail_first: Arc::new(AtomicU64::new(n)),
                ..Default::default()
            }
        }

        fn offered(&self) -> Vec<Batch> {
            self.offered.lock().unwrap().clone()
        }
    }

    impl Sink for ScriptedSink {
        async fn send(&self, batch: &Batch) -> std::result::Result<(), SinkError> {
            self.offered.lock().unwrap().push(batch.clone());
            let left = self.fail_first.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_first.store(left - 1, Ordering::SeqCst);
                return Err(SinkError::Unavailable("scripted failure".into()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn line(route: &AckRoute, ino: u64, start: u64, text: &'static str) -> Event {
        let end = start + text.len() as u64 + 1;
        Event::line(
            FileId::new(1, ino),
            Arc::new(PathBuf::from(format!("/logs/{ino}.log"))),
            0,
            start..end,
            Bytes::from_static(text.as_bytes()),
            true,
            route.clone(),
        )
    }

    fn config(max_events: usize) -> PipelineConfig {
        PipelineConfig {
            max_events,
            max_bytes: 1024 * 1024,
            max_linger: Duration::from_millis(50),
            ingress_capacity: 16,
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                max_attempts: 3,
            },
            shutdown_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_each_source_with_highest_offset() {
        let sink = ScriptedSink::default();
        let (pipeline, publisher) = Pipeline::new(config(4), sink.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));

        let (ack_a, mut rx_a) = bounded(8);
        let (ack_b, mut rx_b) = bounded(8);
        let route_a = AckRoute::new(ack_a, 0);
        let route_b = AckRoute::new(ack_b, 0);

        publisher.publish(line(&route_a, 1, 0, "line1")).await.unwrap();
        publisher.publish(line(&route_b, 2, 0, "other")).await.unwrap();
        publisher.publish(line(&route_a, 1, 6, "line2")).await.unwrap();
        publisher.publish(line(&route_b, 2, 6, "again")).await.unwrap();

        assert_eq!(
            rx_a.next().await,
            Some(Acknowledgement::Ack {
                generation: 0,
                epoch: 0,
                end_offset: 12,
                line_terminated: true
            })
        );
        assert!(matches!(
            rx_b.next().await,
            Some(Acknowledgement::Ack { end_offset: 12, .. })
        ));
        assert!(rx_a.try_recv().is_none());

        let offered = sink.offered();
        assert_eq!(offered.len(), 1);
        let payloads: Vec<_> = offered[0].events().iter().map(|e| e.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"line1"),
                Bytes::from_static(b"other"),
                Bytes::from_static(b"line2"),
                Bytes::from_static(b"again")
            ]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_flushes_partial_batch() {
        let sink = ScriptedSink::default();
        let (pipeline, publisher) = Pipeline::new(config(100), sink.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));

        let (ack_tx, mut ack_rx) = bounded(8);
        let route = AckRoute::new(ack_tx, 0);
        publisher.publish(line(&route, 1, 0, "lonely")).await.unwrap();

        let started = Instant::now();
        assert!(matches!(ack_rx.next().await, Some(Acknowledgement::Ack { end_offset: 7, .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(sink.offered().len(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_twice_then_succeed_resends_same_batch() {
        let sink = ScriptedSink::failing(2);
        let (pipeline, publisher) = Pipeline::new(config(2), sink.clone());
        let stats = pipeline.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));

        let (ack_tx, mut ack_rx) = bounded(8);
        let route = AckRoute::new(ack_tx, 0);
        publisher.publish(line(&route, 1, 0, "line1")).await.unwrap();
        publisher.publish(line(&route, 1, 6, "line2")).await.unwrap();

        assert!(matches!(ack_rx.next().await, Some(Acknowledgement::Ack { end_offset: 12, .. })));

        let offered = sink.offered();
        assert_eq!(offered.len(), 3);
        assert_eq!(offered[0], offered[1]);
        assert_eq!(offered[1], offered[2]);

        let counters = stats.snapshot();
        assert_eq!(counters.send_failures, 2);
        assert_eq!(counters.permanent_failures, 0);
        assert_eq!(counters.batches_delivered, 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_nack_and_keep_running() {
        let sink = ScriptedSink::failing(3);
        let (pipeline, publisher) = Pipeline::new(config(1), sink.clone());
        let stats = pipeline.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));

        let (ack_tx, mut ack_rx) = bounded(8);
        let route = AckRoute::new(ack_tx, 0);
        publisher.publish(line(&route, 1, 0, "doomed")).await.unwrap();

        assert_eq!(
            ack_rx.next().await,
            Some(Acknowledgement::Nack {
                generation: 0,
                epoch: 0,
                from_offset: 0
            })
        );
        assert_eq!(stats.snapshot().permanent_failures, 1);

        publisher.publish(line(&route, 1, 7, "fine")).await.unwrap();
        assert!(matches!(ack_rx.next().await, Some(Acknowledgement::Ack { end_offset: 12, .. })));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_submit_reports_backpressure_and_close() {
        let mut cfg = config(10);
        cfg.ingress_capacity = 1;
        let (pipeline, publisher) = Pipeline::new(cfg, ScriptedSink::default());

        let first = Event::unrouted(EventKind::Line, "a", Bytes::from_static(b"1"));
        let second = Event::unrouted(EventKind::Line, "a", Bytes::from_static(b"2"));

        publisher.submit(first).unwrap();
        match publisher.submit(second.clone()) {
            Err(Rejected::Backpressure(back)) => assert_eq!(back, second),
            other => panic!("expected backpressure, got {other:?}"),
        }
        assert!(!publisher.is_accepting());

        drop(pipeline);
        assert!(matches!(publisher.submit(second), Err(Rejected::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_queued_events() {
        let sink = ScriptedSink::default();
        let (pipeline, publisher) = Pipeline::new(config(100), sink.clone());
        let stats = pipeline.stats();
        let cancel = CancellationToken::new();

        let (ack_tx, mut ack_rx) = bounded(8);
        let route = AckRoute::new(ack_tx, 0);
        publisher.submit(line(&route, 1, 0, "a")).unwrap();
        publisher.submit(line(&route, 1, 2, "b")).unwrap();
        drop(publisher);

        cancel.cancel();
        pipeline.run(cancel).await.unwrap();

        assert!(matches!(ack_rx.next().await, Some(Acknowledgement::Ack { end_offset: 4, .. })));
        assert_eq!(stats.snapshot().events_delivered, 2);
        assert!(!stats.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_batch_that_cannot_be_delivered() {
        let sink = ScriptedSink::failing(u64::MAX);
        let mut cfg = config(100);
        cfg.retry.max_attempts = 100;
        let (pipeline, publisher) = Pipeline::new(cfg, sink.clone());
        let stats = pipeline.stats();
        let cancel = CancellationToken::new();

        let (ack_tx, ack_rx) = bounded(8);
        let route = AckRoute::new(ack_tx, 0);
        publisher.submit(line(&route, 1, 0, "stuck")).unwrap();
        drop(publisher);

        cancel.cancel();
        pipeline.run(cancel).await.unwrap();

        assert!(ack_rx.try_recv().is_none());
        assert_eq!(stats.snapshot().events_abandoned, 1);
        assert_eq!(stats.snapshot().permanent_failures, 0);
    }

    #[test]
    fn test_group_acks_splits_by_epoch() {
        let (tx, _rx) = bounded(8);
        let old = AckRoute::new(tx.clone(), 0);
        let new = AckRoute::new(tx, 1);
        let batch = Batch::from(vec![line(&old, 1, 0, "a"), line(&new, 1, 0, "a"), line(&new, 1, 2, "b")]);

        let acks = group_acks(&batch);
        assert_eq!(acks.len(), 2);
        assert!(matches!(acks[0].1, Acknowledgement::Ack { epoch: 0, end_offset: 2, .. }));
        assert!(matches!(acks[1].1, Acknowledgement::Ack { epoch: 1, end_offset: 4, .. }));
    }
}
