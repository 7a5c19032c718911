use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Number of worker threads started.
    pub workers: usize,
    /// Steps executed by task name.
    pub tasks_executed: HashMap<String, u64>,
    /// Average step duration by task name.
    pub avg_step_duration: HashMap<String, Duration>,
    /// Last time a task of this name finished.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Total steps across all tasks.
    pub steps_total: u64,
    /// Tasks that ran to completion.
    pub tasks_completed: u64,
    /// Steps taken from a worker's private resumption queue.
    pub affine_resumptions: u64,
    /// Steps taken from the global priority queue.
    pub global_dispatches: u64,
    /// Panics captured inside task steps.
    pub panics: u64,
    /// Queued or suspended tasks dropped because the scheduler stopped.
    pub discarded: u64,
}

impl SchedulerMetrics {
    /// Record one step of a task.
    pub fn record_step(&mut self, task_name: &str, duration: Duration) {
        self.steps_total += 1;
        *self.tasks_executed.entry(task_name.to_string()).or_default() += 1;

        let count = self.tasks_executed[task_name];
        let prev_avg = self
            .avg_step_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_step_duration.insert(task_name.to_string(), new_avg);
    }

    pub fn record_completion(&mut self, task_name: &str) {
        self.tasks_completed += 1;
        self.last_run.insert(task_name.to_string(), Utc::now());
    }
}
