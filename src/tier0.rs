//! Tier0 dispatch of independent work to a pool of workers.
//!
//! Work is pickled when it is added to a [`TaskQueue`], whichever mode the
//! queue runs in. A sequential queue runs the pickled work on the calling
//! thread when results are requested. A distributed queue pushes it onto the
//! FIFO command channel of a [`Tier0Pool`] straight away. Either way
//! [`TaskQueue::get_results`] returns outputs in enqueue order.

use std::{
    any::type_name,
    fmt::Debug,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, trace, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_pickle::{DeOptions, SerOptions};

use crate::{
    context::{Context, ContextSnapshot},
    error::{panic_message, Tier0Error},
    executor::{CommandLog, Executor, JobRunner},
    results::{FailedTask, ResultsList},
    task::{execute_scoped, StandardTask, TaskInputs},
};

/// A self-contained unit of work that can be shipped to a worker.
pub trait Tier0Work: Serialize + DeserializeOwned + Send + 'static {
    /// What the work produces. Failures belong in here too, as data.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Do the work.
    fn run(self, env: &Tier0Env) -> Self::Output;

    /// Short description for logs and progress bars.
    fn describe(&self) -> String;
}

/// What every worker holds: the job runner of the process.
#[derive(Clone)]
pub struct Tier0Env {
    /// Runner for external jobs
    pub runner: Arc<dyn JobRunner>,
}

impl Tier0Env {
    /// An environment running jobs through `runner`.
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner }
    }
}

impl Debug for Tier0Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tier0Env").finish_non_exhaustive()
    }
}

type Handler = fn(&[u8], &Tier0Env) -> Result<Vec<u8>, Tier0Error>;
type Reply = (u64, Result<Vec<u8>, Tier0Error>);

fn pickle<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, Tier0Error> {
    serde_pickle::to_vec(value, SerOptions::new()).map_err(|e| Tier0Error::Serialization {
        action: "pickle",
        what: what.to_string(),
        message: e.to_string(),
    })
}

fn unpickle<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, Tier0Error> {
    serde_pickle::from_slice(bytes, DeOptions::new()).map_err(|e| Tier0Error::Serialization {
        action: "unpickle",
        what: what.to_string(),
        message: e.to_string(),
    })
}

fn handle<W: Tier0Work>(payload: &[u8], env: &Tier0Env) -> Result<Vec<u8>, Tier0Error> {
    let work: W = unpickle(payload, type_name::<W>())?;
    let output = work.run(env);
    pickle(&output, type_name::<W::Output>())
}

fn run_contained(request_id: u64, handler: Handler, payload: &[u8], env: &Tier0Env) -> Reply {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(payload, env)))
        .unwrap_or_else(|payload| {
            Err(Tier0Error::WorkerPanic {
                request_id,
                message: panic_message(payload.as_ref()),
            })
        });
    (request_id, result)
}

struct Envelope {
    request_id: u64,
    handler: Handler,
    payload: Vec<u8>,
    reply: Sender<Reply>,
}

/// Worker threads consuming one FIFO command channel.
pub struct Tier0Pool {
    sender: Option<Sender<Envelope>>,
    workers: Vec<JoinHandle<()>>,
    env: Tier0Env,
}

impl Tier0Pool {
    /// Start `num_workers` workers running jobs through `runner`.
    ///
    /// # Errors
    ///
    /// Fails if a worker thread can't be spawned.
    pub fn new(num_workers: usize, runner: Arc<dyn JobRunner>) -> Result<Self, Tier0Error> {
        let (sender, receiver) = unbounded::<Envelope>();
        let env = Tier0Env::new(runner);
        let workers = (0..num_workers)
            .map(|worker_idx| {
                let receiver: Receiver<Envelope> = receiver.clone();
                let env = env.clone();
                thread::Builder::new()
                    .name(format!("tier0-{worker_idx}"))
                    .spawn(move || {
                        for envelope in receiver.iter() {
                            trace!("worker {} took request {}", worker_idx, envelope.request_id);
                            let reply = run_contained(
                                envelope.request_id,
                                envelope.handler,
                                &envelope.payload,
                                &env,
                            );
                            if envelope.reply.send(reply).is_err() {
                                warn!("dropping reply to an abandoned Tier0 queue");
                            }
                        }
                    })
                    .map_err(|e| Tier0Error::Spawn(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!("started {} Tier0 workers", workers.len());
        Ok(Self {
            sender: Some(sender),
            workers,
            env,
        })
    }

    /// Number of workers
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The environment workers run in
    pub fn env(&self) -> &Tier0Env {
        &self.env
    }

    fn dispatch(&self, envelope: Envelope) -> Result<(), Tier0Error> {
        self.sender
            .as_ref()
            .ok_or(Tier0Error::Disconnected)?
            .send(envelope)
            .map_err(|_| Tier0Error::Disconnected)
    }
}

impl Drop for Tier0Pool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("a Tier0 worker exited abnormally");
            }
        }
    }
}

/// Work deferred until its result is requested.
pub struct SyncTask<W: Tier0Work> {
    request_id: u64,
    payload: Vec<u8>,
    work: PhantomData<fn() -> W>,
}

impl<W: Tier0Work> SyncTask<W> {
    /// Queue-assigned id
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Run the work now, on this thread.
    ///
    /// # Errors
    ///
    /// Fails if the work panics or can't be unpickled.
    pub fn get_result(self, env: &Tier0Env) -> Result<W::Output, Tier0Error> {
        let (_, result) = run_contained(self.request_id, handle::<W>, &self.payload, env);
        unpickle(&result?, type_name::<W::Output>())
    }
}

/// Handle to work pushed to a [`Tier0Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncTask {
    /// Queue-assigned id
    pub request_id: u64,
}

enum Pending<'a, W: Tier0Work> {
    Sync(Vec<SyncTask<W>>),
    Async {
        pool: &'a Tier0Pool,
        handles: Vec<AsyncTask>,
    },
}

/// An append-only queue of independent work, read out once in enqueue order.
pub struct TaskQueue<'a, W: Tier0Work> {
    env: Tier0Env,
    draw_progress: bool,
    pending: Pending<'a, W>,
    descriptions: Vec<String>,
    reply_sender: Sender<Reply>,
    reply_receiver: Receiver<Reply>,
}

impl<'a, W: Tier0Work> TaskQueue<'a, W> {
    /// A queue that distributes to `pool` if `parallel` is set and a pool is
    /// given, and runs sequentially otherwise.
    pub fn new(pool: Option<&'a Tier0Pool>, env: Tier0Env, parallel: bool) -> Self {
        let pending = match pool.filter(|_| parallel) {
            Some(pool) => Pending::Async {
                pool,
                handles: vec![],
            },
            None => Pending::Sync(vec![]),
        };
        let (reply_sender, reply_receiver) = unbounded();
        Self {
            env,
            draw_progress: false,
            pending,
            descriptions: vec![],
            reply_sender,
            reply_receiver,
        }
    }

    /// Draw a progress bar while collecting results.
    pub fn with_progress(mut self, draw_progress: bool) -> Self {
        self.draw_progress = draw_progress;
        self
    }

    /// Whether work goes to a worker pool
    pub fn is_distributed(&self) -> bool {
        matches!(self.pending, Pending::Async { .. })
    }

    /// Number of requests enqueued
    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    /// Whether nothing has been enqueued
    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    /// Enqueue `work`, returning its request id without waiting for it.
    ///
    /// # Errors
    ///
    /// Fails if the work can't be pickled or the pool has shut down.
    pub fn add(&mut self, work: W) -> Result<usize, Tier0Error> {
        let request_id = self.descriptions.len() as u64;
        let description = work.describe();
        let payload = pickle(&work, type_name::<W>())?;
        match &mut self.pending {
            Pending::Async { pool, handles } => {
                pool.dispatch(Envelope {
                    request_id,
                    handler: handle::<W>,
                    payload,
                    reply: self.reply_sender.clone(),
                })?;
                handles.push(AsyncTask { request_id });
            }
            Pending::Sync(tasks) => tasks.push(SyncTask {
                request_id,
                payload,
                work: PhantomData,
            }),
        }
        trace!("enqueued request {}: {}", request_id, description);
        self.descriptions.push(description);
        Ok(request_id as usize)
    }

    /// Wait for every request and return their outputs in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns the first error in enqueue order: a panic while running a
    /// request, a pickling failure or a pool shutdown.
    pub fn get_results(self) -> Result<Vec<W::Output>, Tier0Error> {
        let Self {
            env,
            draw_progress,
            pending,
            descriptions,
            reply_sender,
            reply_receiver,
        } = self;
        let draw_target = if draw_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let progress = ProgressBar::with_draw_target(Some(descriptions.len() as u64), draw_target);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})")
        {
            progress.set_style(style.progress_chars("=> "));
        }
        progress.set_message("tier0 requests");

        let results = match pending {
            Pending::Sync(tasks) => tasks
                .into_iter()
                .map(|task| {
                    let output = task.get_result(&env);
                    progress.inc(1);
                    output
                })
                .collect::<Vec<_>>(),
            Pending::Async { pool, handles } => {
                drop(reply_sender);
                trace!("waiting on {} Tier0 workers", pool.num_workers());
                let mut replies: Vec<Option<Result<Vec<u8>, Tier0Error>>> =
                    (0..handles.len()).map(|_| None).collect();
                for _ in &handles {
                    let (request_id, reply) = reply_receiver
                        .recv()
                        .map_err(|_| Tier0Error::Disconnected)?;
                    trace!("request {} done", request_id);
                    if let Some(slot) = replies.get_mut(request_id as usize) {
                        *slot = Some(reply);
                    }
                    progress.inc(1);
                }
                replies
                    .into_iter()
                    .map(|reply| {
                        reply
                            .unwrap_or(Err(Tier0Error::Disconnected))
                            .and_then(|bytes| unpickle(&bytes, type_name::<W::Output>()))
                    })
                    .collect::<Vec<_>>()
            }
        };
        progress.finish();
        results.into_iter().collect()
    }
}

/// A whole task shipped to a worker with a snapshot of the context.
///
/// The worker builds a private [`Context`] from the snapshot and runs the task
/// there. Its result comes back for the client to merge.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Tier0TaskRequest<T: StandardTask> {
    /// Inputs of the task
    pub inputs: T::Inputs,
    /// What the task may read of the context
    pub snapshot: ContextSnapshot,
    /// Whether jobs are only recorded
    pub dry_run: bool,
    #[serde(skip)]
    task: PhantomData<fn() -> T>,
}

impl<T: StandardTask> Tier0TaskRequest<T> {
    /// Package `inputs` with `snapshot`.
    pub fn new(inputs: T::Inputs, snapshot: ContextSnapshot, dry_run: bool) -> Self {
        Self {
            inputs,
            snapshot,
            dry_run,
            task: PhantomData,
        }
    }
}

impl<T: StandardTask> Tier0Work for Tier0TaskRequest<T> {
    type Output = Result<ResultsList<T::Payload>, FailedTask>;

    fn run(self, env: &Tier0Env) -> Self::Output {
        let vis = self.inputs.vis().to_vec();
        let context = Context::from(self.snapshot);
        let mut command_log = CommandLog::default();
        let mut executor = Executor::new(env, &mut command_log, context.task_counter)
            .with_dry_run(self.dry_run);
        let task = T::new(self.inputs);
        execute_scoped(task, &context, &mut executor).map_err(|e| {
            let (frames, state) = executor
                .failure_trace()
                .map(|(frames, state)| (frames.clone(), Some(*state)))
                .unwrap_or_default();
            FailedTask::from_error(T::NAME, &vis, &e, state, frames)
        })
    }

    fn describe(&self) -> String {
        format!("{} [{}]", T::NAME, self.inputs.vis().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::JobError, executor::JobRequest, test_common::EchoRunner};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Square(i64);

    impl Tier0Work for Square {
        type Output = i64;

        fn run(self, _env: &Tier0Env) -> i64 {
            if self.0 == 13 {
                panic!("unlucky");
            }
            // stagger completion so replies arrive out of order
            thread::sleep(std::time::Duration::from_millis((20 - self.0.min(20)) as u64));
            self.0 * self.0
        }

        fn describe(&self) -> String {
            format!("square {}", self.0)
        }
    }

    fn squares(queue: &mut TaskQueue<'_, Square>, values: &[i64]) {
        for value in values {
            queue.add(Square(*value)).unwrap();
        }
    }

    #[test]
    fn test_sequential_and_distributed_agree() {
        let pool = Tier0Pool::new(3, Arc::new(EchoRunner)).unwrap();
        let values = (0..12).collect::<Vec<_>>();

        let mut sequential = TaskQueue::new(Some(&pool), pool.env().clone(), false);
        squares(&mut sequential, &values);
        assert!(!sequential.is_distributed());

        let mut distributed = TaskQueue::new(Some(&pool), pool.env().clone(), true);
        squares(&mut distributed, &values);
        assert!(distributed.is_distributed());
        assert_eq!(distributed.len(), 12);

        let expected = values.iter().map(|v| v * v).collect::<Vec<_>>();
        assert_eq!(sequential.get_results().unwrap(), expected);
        assert_eq!(distributed.get_results().unwrap(), expected);
    }

    #[test]
    fn test_parallel_without_pool_runs_sequentially() {
        let env = Tier0Env::new(Arc::new(EchoRunner));
        let mut queue = TaskQueue::<Square>::new(None, env, true);
        assert!(!queue.is_distributed());
        assert_eq!(queue.add(Square(2)).unwrap(), 0);
        assert_eq!(queue.add(Square(3)).unwrap(), 1);
        assert_eq!(queue.get_results().unwrap(), vec![4, 9]);
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let pool = Tier0Pool::new(2, Arc::new(EchoRunner)).unwrap();
        for parallel in [false, true] {
            let mut queue = TaskQueue::new(Some(&pool), pool.env().clone(), parallel);
            squares(&mut queue, &[1, 13, 2]);
            assert_eq!(
                queue.get_results(),
                Err(Tier0Error::WorkerPanic {
                    request_id: 1,
                    message: "unlucky".into()
                })
            );
        }
        // the pool survives a panicking request
        let mut queue = TaskQueue::new(Some(&pool), pool.env().clone(), true);
        squares(&mut queue, &[5]);
        assert_eq!(queue.get_results().unwrap(), vec![25]);
    }

    #[test]
    fn test_jobs_run_on_workers() {
        let pool = Tier0Pool::new(2, Arc::new(EchoRunner)).unwrap();
        let mut queue = TaskQueue::new(Some(&pool), pool.env().clone(), true);
        queue
            .add(JobRequest::new("gaincal").arg("vis", "a.ms"))
            .unwrap();
        queue.add(JobRequest::new("fail")).unwrap();
        let results = queue.get_results().unwrap();
        assert_eq!(
            results[0].as_ref().unwrap().values,
            vec![
                ("task".to_string(), "gaincal".to_string()),
                ("vis".to_string(), "a.ms".to_string())
            ]
        );
        assert!(matches!(results[1], Err(JobError::Failed { .. })));
    }

    #[test]
    fn test_empty_queue() {
        let env = Tier0Env::new(Arc::new(EchoRunner));
        let queue = TaskQueue::<Square>::new(None, env, false);
        assert!(queue.is_empty());
        assert!(queue.get_results().unwrap().is_empty());
    }
}
