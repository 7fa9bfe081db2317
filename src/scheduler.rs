// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded job queue for per-host work.
//!
//! Jobs are queued with [`HostScheduler::submit`], the queue is sealed with
//! [`HostScheduler::close`], and [`HostScheduler::run`] drives at most
//! `max_concurrency` of them at a time as tokio tasks. Every job that was
//! started is joined before `run` returns, including on Ctrl-C when the
//! scheduler was given an [`Interrupts`] handle.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::utils::interrupt::Interrupts;

pub type Job<T> = BoxFuture<'static, Result<T>>;

/// What a finished job left behind.
#[derive(Debug)]
pub struct JobOutcome<T> {
    /// 0 on success, 1 when the job failed, panicked or was interrupted.
    pub exit_code: i32,
    pub result: Result<T>,
}

/// A job's own result, or the message of the panic that ended it.
type Finished<T> = std::result::Result<Result<T>, String>;

impl<T> JobOutcome<T> {
    fn from_result(result: Result<T>) -> Self {
        Self {
            exit_code: if result.is_ok() { 0 } else { 1 },
            result,
        }
    }

    fn from_finished(host: &str, finished: Finished<T>) -> Self {
        match finished {
            Ok(result) => Self::from_result(result),
            Err(message) => Self::from_result(Err(Error::WorkerPanicked {
                host: host.to_string(),
                message,
            })),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct HostScheduler<T> {
    max_concurrency: usize,
    queue: VecDeque<(String, Job<T>)>,
    closed: bool,
    interrupts: Option<Interrupts>,
}

impl<T: Send + 'static> HostScheduler<T> {
    /// `max_concurrency` of 0 is treated as 1.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            queue: VecDeque::new(),
            closed: false,
            interrupts: None,
        }
    }

    /// Stop the run when `interrupts` reports a press.
    pub fn with_interrupts(mut self, interrupts: Interrupts) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn submit(&mut self, host: impl Into<String>, job: Job<T>) {
        let host = host.into();
        if self.closed {
            warn!("Job queue is closed; ignoring job for {host}");
            return;
        }
        self.queue.push_back((host, job));
    }

    pub fn close(&mut self) {
        debug!("Job queue closed with {} job(s)", self.queue.len());
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Runs every queued job and returns `(host, outcome)` in submission order.
    ///
    /// On Ctrl-C no further jobs are started; running jobs are aborted,
    /// joined, and recorded as interrupted. Jobs that never started are
    /// left out of the result.
    pub async fn run(mut self) -> Result<Vec<(String, JobOutcome<T>)>> {
        if !self.closed {
            return Err(Error::QueueNotClosed);
        }

        let total = self.queue.len();
        let mut keys: Vec<String> = Vec::with_capacity(total);
        let mut outcomes: Vec<Option<JobOutcome<T>>> = (0..total).map(|_| None).collect();
        let mut running: HashMap<usize, JoinHandle<()>> = HashMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Finished<T>)>();

        let interrupts = self.interrupts.take();
        let mut interrupted = false;

        loop {
            while !interrupted && running.len() < self.max_concurrency {
                let Some((host, job)) = self.queue.pop_front() else {
                    break;
                };
                let index = keys.len();
                debug!("Job queue starting: {host}");
                keys.push(host);
                let tx = tx.clone();
                let handle = tokio::spawn(async move {
                    let finished = AssertUnwindSafe(job)
                        .catch_unwind()
                        .await
                        .map_err(|payload| panic_message(payload.as_ref()));
                    let _ = tx.send((index, finished));
                });
                running.insert(index, handle);
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some((index, finished)) = rx.recv() => {
                    if let Some(handle) = running.remove(&index) {
                        let _ = handle.await;
                    }
                    let outcome = JobOutcome::from_finished(&keys[index], finished);
                    debug!("Job queue finished: {} (exit code {})", keys[index], outcome.exit_code);
                    outcomes[index] = Some(outcome);
                }
                _ = wait_for_interrupt(interrupts.as_ref()), if !interrupted => {
                    warn!("Interrupted; stopping {} running job(s)", running.len());
                    interrupted = true;
                    for handle in running.values() {
                        handle.abort();
                    }
                    for (index, handle) in running.drain() {
                        let _ = handle.await;
                        outcomes[index] = Some(JobOutcome::from_result(Err(Error::Interrupted)));
                    }
                    while let Ok((index, finished)) = rx.try_recv() {
                        outcomes[index] = Some(JobOutcome::from_finished(&keys[index], finished));
                    }
                }
            }
        }

        Ok(keys
            .into_iter()
            .zip(outcomes)
            .filter_map(|(host, outcome)| outcome.map(|outcome| (host, outcome)))
            .collect())
    }
}

async fn wait_for_interrupt(interrupts: Option<&Interrupts>) {
    match interrupts {
        Some(interrupts) => interrupts.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::interrupt::InterruptSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_before_close_is_an_error() {
        let mut scheduler = HostScheduler::<()>::new(2);
        scheduler.submit("a", async { Ok(()) }.boxed());
        assert!(matches!(scheduler.run().await, Err(Error::QueueNotClosed)));
    }

    #[tokio::test]
    async fn test_submit_after_close_is_ignored() {
        let mut scheduler = HostScheduler::<()>::new(2);
        scheduler.close();
        scheduler.submit("a", async { Ok(()) }.boxed());
        assert!(scheduler.is_empty());
        assert!(scheduler.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_means_one() {
        assert_eq!(HostScheduler::<()>::new(0).max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut scheduler = HostScheduler::new(3);
        for i in 0..10 {
            let current = current.clone();
            let peak = peak.clone();
            scheduler.submit(
                format!("host{i}"),
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
                .boxed(),
            );
        }
        scheduler.close();
        let results = scheduler.run().await.unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        for (i, (host, outcome)) in results.iter().enumerate() {
            assert_eq!(host, &format!("host{i}"));
            assert_eq!(outcome.exit_code, 0);
            assert_eq!(*outcome.result.as_ref().unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_captured() {
        let mut scheduler = HostScheduler::<&'static str>::new(2);
        scheduler.submit("ok", async { Ok("fine") }.boxed());
        scheduler.submit("err", async { Err(Error::Abort("nope".into())) }.boxed());
        scheduler.submit(
            "boom",
            async {
                if true {
                    panic!("worker exploded");
                }
                Ok("unreachable")
            }
            .boxed(),
        );
        scheduler.close();
        let results = scheduler.run().await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1.exit_code, 0);
        assert_eq!(results[1].1.exit_code, 1);
        assert!(matches!(results[1].1.result, Err(Error::Abort(_))));
        assert_eq!(results[2].1.exit_code, 1);
        match &results[2].1.result {
            Err(Error::WorkerPanicked { host, message }) => {
                assert_eq!(host, "boom");
                assert!(message.contains("worker exploded"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interrupt_stops_running_and_queued_jobs() {
        let source = InterruptSource::new();
        let mut scheduler = HostScheduler::<()>::new(2).with_interrupts(source.subscribe());
        for host in ["a", "b", "c"] {
            scheduler.submit(host, async { std::future::pending().await }.boxed());
        }
        scheduler.close();

        let raiser = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            raiser.raise();
        });
        let results = scheduler.run().await.unwrap();

        let hosts: Vec<_> = results.iter().map(|(host, _)| host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b"]);
        for (_, outcome) in &results {
            assert!(matches!(outcome.result, Err(Error::Interrupted)));
            assert_eq!(outcome.exit_code, 1);
        }
    }

    #[tokio::test]
    async fn test_press_before_run_stops_everything() {
        let source = InterruptSource::new();
        let interrupts = source.subscribe();
        source.raise();
        let mut scheduler = HostScheduler::<()>::new(1).with_interrupts(interrupts);
        scheduler.submit("a", async { std::future::pending().await }.boxed());
        scheduler.submit("b", async { Ok(()) }.boxed());
        scheduler.close();

        let results = scheduler.run().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1.result, Err(Error::Interrupted)));
    }
}
