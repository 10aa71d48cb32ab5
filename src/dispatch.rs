//! Running independent per-file jobs, one after another or on a worker pool.
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, error};

#[cfg(feature = "parallelism")]
use log::warn;
#[cfg(feature = "parallelism")]
use rayon::prelude::*;

use crate::error::{ProcessingError, WorkflowError};
use crate::stages::Stage;

/// A shared flag that stops a batch between jobs
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    Sequential,
    Parallel(usize),
}

impl DispatchStrategy {
    /// Jobs run in the caller when only one worker is requested, there is only
    /// one job, or the files must not be read concurrently.
    pub fn choose(workers: usize, jobs: usize, exclusive: bool) -> Self {
        if workers <= 1 || jobs <= 1 || exclusive || !cfg!(feature = "parallelism") {
            Self::Sequential
        } else {
            Self::Parallel(workers.min(jobs))
        }
    }
}

/// A job that did not complete
#[derive(Debug)]
pub struct FileFailure {
    pub file: PathBuf,
    pub stage: Stage,
    pub error: WorkflowError,
}

/// One result per dispatched job, keyed by file, in submission order
#[derive(Debug)]
pub struct DispatchOutcome<T> {
    pub stage: Stage,
    pub results: IndexMap<PathBuf, Result<T, WorkflowError>>,
}

impl<T> DispatchOutcome<T> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }

    /// Split into successful values and failures
    pub fn partition(self) -> (IndexMap<PathBuf, T>, Vec<FileFailure>) {
        let stage = self.stage;
        let mut successes = IndexMap::new();
        let mut failures = Vec::new();
        for (file, result) in self.results {
            match result {
                Ok(value) => {
                    successes.insert(file, value);
                }
                Err(error) => failures.push(FileFailure { file, stage, error }),
            }
        }
        (successes, failures)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    workers: usize,
    abort: AbortHandle,
}

impl Dispatcher {
    pub fn new(workers: usize, abort: AbortHandle) -> Self {
        Self {
            workers: workers.max(1),
            abort,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn run_job<J, T, F>(&self, stage: Stage, path: &Path, job: J, task: &F) -> Result<T, WorkflowError>
    where
        F: Fn(&Path, J) -> Result<T, WorkflowError>,
    {
        if self.abort.is_aborted() {
            debug!("{}: {stage} not started, batch aborted", path.display());
            return Err(ProcessingError::Aborted.into());
        }
        let result = match panic::catch_unwind(AssertUnwindSafe(|| task(path, job))) {
            Ok(result) => result,
            Err(payload) => Err(ProcessingError::Panicked(panic_message(payload)).into()),
        };
        if let Err(e) = result.as_ref() {
            error!("{}: {stage} failed: {e}", path.display());
        }
        result
    }

    fn run_sequential<J, T, F>(
        &self,
        stage: Stage,
        jobs: Vec<(PathBuf, J)>,
        task: &F,
    ) -> Vec<(PathBuf, Result<T, WorkflowError>)>
    where
        F: Fn(&Path, J) -> Result<T, WorkflowError>,
    {
        jobs.into_iter()
            .map(|(path, job)| {
                let result = self.run_job(stage, &path, job, task);
                (path, result)
            })
            .collect()
    }

    #[cfg(feature = "parallelism")]
    fn run_parallel<J, T, F>(
        &self,
        stage: Stage,
        workers: usize,
        jobs: Vec<(PathBuf, J)>,
        task: &F,
    ) -> Vec<(PathBuf, Result<T, WorkflowError>)>
    where
        J: Send,
        T: Send,
        F: Fn(&Path, J) -> Result<T, WorkflowError> + Sync,
    {
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(|| {
                jobs.into_par_iter()
                    .map(|(path, job)| {
                        let result = self.run_job(stage, &path, job, task);
                        (path, result)
                    })
                    .collect()
            }),
            Err(e) => {
                warn!("Failed to start a {workers} thread pool for {stage}, running sequentially: {e}");
                self.run_sequential(stage, jobs, task)
            }
        }
    }

    #[cfg(not(feature = "parallelism"))]
    fn run_parallel<J, T, F>(
        &self,
        stage: Stage,
        _workers: usize,
        jobs: Vec<(PathBuf, J)>,
        task: &F,
    ) -> Vec<(PathBuf, Result<T, WorkflowError>)>
    where
        F: Fn(&Path, J) -> Result<T, WorkflowError>,
    {
        self.run_sequential(stage, jobs, task)
    }

    /// Run `task` once per job. Errors and panics are caught at the job boundary
    /// and recorded against the job's file, so the outcome always holds exactly
    /// one result per job.
    pub fn run<J, T, F>(
        &self,
        stage: Stage,
        jobs: Vec<(PathBuf, J)>,
        exclusive: bool,
        task: F,
    ) -> DispatchOutcome<T>
    where
        J: Send,
        T: Send,
        F: Fn(&Path, J) -> Result<T, WorkflowError> + Sync,
    {
        let strategy = DispatchStrategy::choose(self.workers, jobs.len(), exclusive);
        debug!("Dispatching {} {stage} jobs: {strategy:?}", jobs.len());
        let results = match strategy {
            DispatchStrategy::Sequential => self.run_sequential(stage, jobs, &task),
            DispatchStrategy::Parallel(workers) => self.run_parallel(stage, workers, jobs, &task),
        };
        DispatchOutcome {
            stage,
            results: results.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn jobs(n: usize) -> Vec<(PathBuf, usize)> {
        (0..n)
            .map(|i| (PathBuf::from(format!("file_{i}.mgf")), i))
            .collect()
    }

    #[test]
    fn test_strategy() {
        assert_eq!(DispatchStrategy::choose(1, 10, false), DispatchStrategy::Sequential);
        assert_eq!(DispatchStrategy::choose(4, 1, false), DispatchStrategy::Sequential);
        assert_eq!(DispatchStrategy::choose(4, 10, true), DispatchStrategy::Sequential);
        if cfg!(feature = "parallelism") {
            assert_eq!(DispatchStrategy::choose(4, 10, false), DispatchStrategy::Parallel(4));
            assert_eq!(DispatchStrategy::choose(8, 3, false), DispatchStrategy::Parallel(3));
        }
    }

    #[test_log::test]
    fn test_one_failure_among_many() {
        for workers in [1, 4] {
            let dispatcher = Dispatcher::new(workers, AbortHandle::new());
            let outcome = dispatcher.run(Stage::FeatureExtraction, jobs(6), false, |_, i| {
                if i == 3 {
                    Err(ProcessingError::Engine("no features".into()).into())
                } else {
                    Ok(i * 2)
                }
            });
            assert_eq!(outcome.len(), 6);
            assert_eq!(outcome.success_count(), 5);
            assert!(outcome.results[&PathBuf::from("file_3.mgf")].is_err());
            let (successes, failures) = outcome.partition();
            assert_eq!(successes[&PathBuf::from("file_5.mgf")], 10);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].stage, Stage::FeatureExtraction);
            assert_eq!(failures[0].file, PathBuf::from("file_3.mgf"));
        }
    }

    #[test_log::test]
    fn test_panic_is_a_file_failure() {
        let dispatcher = Dispatcher::new(2, AbortHandle::new());
        let outcome = dispatcher.run(Stage::SpectralMatching, jobs(3), false, |_, i| {
            if i == 0 {
                panic!("corrupt spectrum");
            }
            Ok(i)
        });
        assert_eq!(outcome.len(), 3);
        assert_eq!(outcome.failure_count(), 1);
        match &outcome.results[&PathBuf::from("file_0.mgf")] {
            Err(WorkflowError::Processing(ProcessingError::Panicked(message))) => {
                assert!(message.contains("corrupt spectrum"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_log::test]
    fn test_abort_between_jobs() {
        let abort = AbortHandle::new();
        let dispatcher = Dispatcher::new(1, abort.clone());
        let started = AtomicUsize::new(0);
        let outcome = dispatcher.run(Stage::FeatureExtraction, jobs(4), true, |_, i| {
            started.fetch_add(1, Ordering::SeqCst);
            if i == 1 {
                abort.abort();
            }
            Ok(i)
        });
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.len(), 4);
        assert_eq!(outcome.success_count(), 2);
        assert!(matches!(
            outcome.results[&PathBuf::from("file_3.mgf")],
            Err(WorkflowError::Processing(ProcessingError::Aborted))
        ));
    }
}
