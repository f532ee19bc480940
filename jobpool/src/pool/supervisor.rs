//! The pool supervisor: one task owning all pool state.
//!
//! The supervisor runs a single event loop over three channels:
//! - commands from [`super::Pool`] (submit, drain, shutdown),
//! - events from execution units (responses, failures, exits),
//! - notices from its own background tasks (timeouts, cancellations,
//!   delayed respawns).
//!
//! Each message is handled to completion, then a dispatch pass matches
//! queued jobs to units and a fresh stats snapshot is published. Nothing
//! here blocks and nothing needs a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::queue::JobQueue;
use super::restart::RestartLimiter;
use super::stats::PoolStats;
use crate::config::{PoolConfig, PoolMode};
use crate::error::{PoolError, UnitFailure};
use crate::models::{Job, JobId};
use crate::protocol::{Request, Response};
use crate::unit::{UnitBackend, UnitEvent, UnitEventKind, UnitHandle, UnitId};

/// Requests from the public pool handle.
pub(super) enum Command {
    Submit(Job),
    Drain {
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reason: String,
        reply: oneshot::Sender<()>,
    },
}

/// Messages from the supervisor's own background tasks.
#[derive(Debug)]
enum Notice {
    TimedOut { job: JobId, after: Duration },
    Cancelled(JobId),
    Respawn,
}

/// A live execution unit and the job bound to it, if any.
struct Unit {
    handle: Box<dyn UnitHandle>,
    job: Option<Job>,
}

impl Unit {
    const fn is_idle(&self) -> bool {
        self.job.is_none()
    }
}

pub(super) struct Supervisor {
    config: PoolConfig,
    backend: Arc<dyn UnitBackend>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<UnitEvent>,
    events_rx: mpsc::UnboundedReceiver<UnitEvent>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: mpsc::UnboundedReceiver<Notice>,
    stats: watch::Sender<PoolStats>,
    closed: Arc<OnceLock<String>>,
    queue: JobQueue,
    units: BTreeMap<UnitId, Unit>,
    assignments: HashMap<JobId, UnitId>,
    limiter: RestartLimiter,
    /// Persistent slots left empty because the restart budget ran out.
    vacancies: usize,
    next_unit_id: UnitId,
    stopped: bool,
}

impl Supervisor {
    pub(super) fn new(
        config: PoolConfig,
        backend: Arc<dyn UnitBackend>,
        commands: mpsc::UnboundedReceiver<Command>,
        stats: watch::Sender<PoolStats>,
        closed: Arc<OnceLock<String>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let limiter = RestartLimiter::new(&config.restart);

        Self {
            config,
            backend,
            commands,
            events_tx,
            events_rx,
            notices_tx,
            notices_rx,
            stats,
            closed,
            queue: JobQueue::new(),
            units: BTreeMap::new(),
            assignments: HashMap::new(),
            limiter,
            vacancies: 0,
            next_unit_id: 0,
            stopped: false,
        }
    }

    pub(super) async fn run(mut self) {
        info!(
            mode = %self.config.mode,
            size = self.config.size,
            backend = self.backend.name(),
            "pool started"
        );

        if self.config.mode == PoolMode::Persistent {
            for _ in 0..self.config.size {
                if self.start_unit().is_err() {
                    self.replace_slot();
                }
            }
        }
        self.publish_stats();

        while !self.stopped {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.shutdown("pool dropped"),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice),
            }

            self.dispatch();
            self.publish_stats();
        }

        debug!("pool supervisor stopped");
    }

    fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(job) => self.enqueue(job),
            Command::Drain { reason, reply } => {
                let drained = self.drain_queue(|| PoolError::Drained {
                    reason: reason.clone(),
                });
                info!(drained, %reason, "queue drained");
                let _ = reply.send(drained);
            }
            Command::Shutdown { reason, reply } => {
                self.shutdown(&reason);
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, mut job: Job) {
        if let Some(reason) = self.closed.get() {
            job.settle(Err(PoolError::ShuttingDown {
                reason: reason.clone(),
            }));
            return;
        }

        let notices = self.notices_tx.clone();
        let id = job.id;
        job.on_cancel(move || {
            let _ = notices.send(Notice::Cancelled(id));
        });

        trace!(job = %id, queued = self.queue.len() + 1, "job queued");
        self.queue.push_back(job);
    }

    fn handle_event(&mut self, event: UnitEvent) {
        let UnitEvent { unit, kind } = event;
        match kind {
            UnitEventKind::Message(value) => self.handle_message(unit, value),
            UnitEventKind::Failure(failure) => self.fail_unit(unit, failure),
            UnitEventKind::Exited(code) => self.fail_unit(unit, UnitFailure::Exited(code)),
        }
    }

    fn handle_message(&mut self, unit_id: UnitId, value: Value) {
        if !self.units.contains_key(&unit_id) {
            trace!(unit = unit_id, "ignoring message from retired unit");
            return;
        }

        let response = match Response::decode(value) {
            Ok(response) => response,
            Err(violation) => return self.fail_unit(unit_id, UnitFailure::Protocol(violation.0)),
        };

        let Some(job) = self.units.get_mut(&unit_id).and_then(|unit| unit.job.take()) else {
            let detail = "response received while no job was bound".to_string();
            return self.fail_unit(unit_id, UnitFailure::Protocol(detail));
        };
        self.assignments.remove(&job.id);

        match response {
            Response::Success(result) => job.settle(Ok(result)),
            Response::Failure(error) => job.settle(Err(PoolError::Job(error))),
        }

        if self.config.mode == PoolMode::Ephemeral {
            self.retire(unit_id);
        }
    }

    fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::TimedOut { job, after } => {
                if let Some(&unit) = self.assignments.get(&job) {
                    self.fail_unit(unit, UnitFailure::TimedOut(after));
                }
            }
            Notice::Cancelled(job) => {
                if let Some(queued) = self.queue.remove(job) {
                    debug!(job = %job, "queued job cancelled");
                    queued.settle(Err(PoolError::Aborted));
                } else if let Some(&unit) = self.assignments.get(&job) {
                    self.fail_unit(unit, UnitFailure::Aborted);
                }
            }
            Notice::Respawn => {
                if self.is_closed() {
                    return;
                }
                if self.start_unit().is_err() {
                    self.replace_slot();
                }
            }
        }
    }

    /// Take a unit out of service, rejecting its job with `failure`.
    /// Unknown units are ignored, which makes repeated failures harmless.
    fn fail_unit(&mut self, unit_id: UnitId, failure: UnitFailure) {
        let Some(mut unit) = self.units.remove(&unit_id) else {
            trace!(unit = unit_id, %failure, "ignoring failure of retired unit");
            return;
        };
        warn!(unit = unit_id, %failure, "execution unit failed");

        if let Some(job) = unit.job.take() {
            self.assignments.remove(&job.id);
            job.settle(Err(failure.into_job_error(unit_id)));
        }
        unit.handle.terminate();

        if self.config.mode == PoolMode::Persistent && !self.is_closed() {
            self.replace_slot();
        }
    }

    /// Stop a unit that finished normally.
    fn retire(&mut self, unit_id: UnitId) {
        if let Some(mut unit) = self.units.remove(&unit_id) {
            unit.handle.terminate();
            trace!(unit = unit_id, "execution unit retired");
        }
    }

    fn start_unit(&mut self) -> anyhow::Result<UnitId> {
        let id = self.next_unit_id;
        self.next_unit_id += 1;

        match self
            .backend
            .spawn(id, &self.config.init_data, self.events_tx.clone())
        {
            Ok(handle) => {
                self.units.insert(id, Unit { handle, job: None });
                debug!(unit = id, live = self.units.len(), "execution unit started");
                Ok(id)
            }
            Err(err) => {
                warn!(unit = id, error = %format!("{err:#}"), "failed to start execution unit");
                Err(err)
            }
        }
    }

    /// Ask the restart limiter for a replacement of one persistent slot.
    fn replace_slot(&mut self) {
        if self.limiter.try_acquire(Instant::now()) {
            self.schedule_respawn();
        } else {
            self.vacancies += 1;
            warn!(
                vacancies = self.vacancies,
                max_restarts = ?self.config.restart.max_restarts,
                "restart limit reached, running with fewer units"
            );
        }
    }

    fn schedule_respawn(&self) {
        let notices = self.notices_tx.clone();
        let delay = self.config.restart.delay;
        debug!(restarts = self.limiter.count(), ?delay, "replacement scheduled");
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = notices.send(Notice::Respawn);
        });
    }

    fn dispatch(&mut self) {
        if self.is_closed() {
            return;
        }
        match self.config.mode {
            PoolMode::Persistent => self.dispatch_persistent(),
            PoolMode::Ephemeral => self.dispatch_ephemeral(),
        }
    }

    fn dispatch_persistent(&mut self) {
        // A new restart window may have opened since a slot went vacant.
        while self.vacancies > 0 && self.limiter.try_acquire(Instant::now()) {
            self.vacancies -= 1;
            self.schedule_respawn();
        }

        let idle: Vec<UnitId> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.is_idle())
            .map(|(id, _)| *id)
            .collect();

        for unit_id in idle {
            // An earlier assignment in this pass may have failed a unit.
            if !self.units.get(&unit_id).is_some_and(Unit::is_idle) {
                continue;
            }
            let Some(job) = self.next_job() else {
                break;
            };
            self.assign(unit_id, job);
        }
    }

    fn dispatch_ephemeral(&mut self) {
        while self.units.len() < self.config.size {
            let Some(job) = self.next_job() else {
                break;
            };
            match self.start_unit() {
                Ok(unit_id) => self.assign(unit_id, job),
                Err(err) => job.settle(Err(PoolError::Spawn(format!("{err:#}")))),
            }
        }
    }

    /// Pop the oldest job that has not been cancelled yet.
    fn next_job(&mut self) -> Option<Job> {
        while let Some(job) = self.queue.pop_front() {
            if job.is_cancelled() {
                debug!(job = %job.id, "skipping job cancelled before dispatch");
                job.settle(Err(PoolError::Aborted));
                continue;
            }
            return Some(job);
        }
        None
    }

    fn assign(&mut self, unit_id: UnitId, mut job: Job) {
        let Some(unit) = self.units.get_mut(&unit_id) else {
            self.queue.push_back(job);
            return;
        };

        let request = Request::new(std::mem::take(&mut job.payload));
        if let Some(after) = job.effective_timeout(self.config.default_timeout) {
            let notices = self.notices_tx.clone();
            let id = job.id;
            job.arm_timer(after, move || {
                let _ = notices.send(Notice::TimedOut { job: id, after });
            });
        }

        let job_id = job.id;
        let sent = unit.handle.send(&request);
        unit.job = Some(job);
        self.assignments.insert(job_id, unit_id);
        debug!(job = %job_id, unit = unit_id, "job dispatched");

        if let Err(failure) = sent {
            self.fail_unit(unit_id, failure);
        }
    }

    /// Reject every queued job with the error `make_error` builds.
    fn drain_queue(&mut self, make_error: impl Fn() -> PoolError) -> usize {
        let jobs = self.queue.drain();
        let count = jobs.len();
        for job in jobs {
            job.settle(Err(make_error()));
        }
        count
    }

    fn shutdown(&mut self, reason: &str) {
        let _ = self.closed.set(reason.to_string());
        let reason = self.closed.get().map_or(reason, String::as_str).to_string();

        let queued = self.drain_queue(|| PoolError::ShuttingDown {
            reason: reason.clone(),
        });

        let units = std::mem::take(&mut self.units);
        let mut in_flight = 0;
        for (_, mut unit) in units {
            if let Some(job) = unit.job.take() {
                in_flight += 1;
                job.settle(Err(PoolError::ShuttingDown {
                    reason: reason.clone(),
                }));
            }
            unit.handle.terminate();
        }
        self.assignments.clear();
        self.vacancies = 0;
        self.stopped = true;

        info!(%reason, queued, in_flight, "pool shut down");
    }

    fn publish_stats(&self) {
        let active_jobs = self.assignments.len();
        let idle_units = self.units.values().filter(|unit| unit.is_idle()).count();
        self.stats.send_replace(PoolStats {
            mode: self.config.mode,
            size: self.config.size,
            active_jobs,
            queued_jobs: self.queue.len(),
            live_units: self.units.len(),
            idle_units,
            shutting_down: self.is_closed(),
        });
    }
}
