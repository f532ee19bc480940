//! FIFO backlog of submitted but not yet dispatched jobs.

use std::collections::VecDeque;

use crate::models::{Job, JobId};

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Take a job out of the queue wherever it sits.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        self.jobs.remove(index)
    }

    /// Empty the queue, oldest job first.
    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
