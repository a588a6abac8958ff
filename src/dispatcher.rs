//! Batch dispatcher
//!
//! Fans a list of [`Request`]s out over the [`SessionPool`], one task per
//! endpoint, and returns exactly one [`OperationResult`] per request in input
//! order. A failing request never affects the others.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FleetError, Result};
use crate::operation::{Operation, OperationResult, Request};
use crate::pool::SessionPool;
use crate::retry::RetryPolicy;
use crate::ssh::{CommandOutput, EndpointId};

/// Runs batches of requests against a shared pool
#[derive(Clone)]
pub struct Dispatcher {
    pool: SessionPool,
    retry: RetryPolicy,
    max_in_flight: usize,
    max_command_chars: Option<usize>,
    cancel: CancellationToken,
}

/// Failure of a single attempt
enum AttemptError {
    /// The pool could not provide a session; it already retried the connect
    Acquire(FleetError),
    /// The operation itself failed
    Run(FleetError),
}

impl Dispatcher {
    /// Dispatcher using the pool's retry, concurrency and validation settings
    pub fn new(pool: SessionPool) -> Self {
        let config = pool.config();
        Self {
            retry: config.retry_policy(),
            max_in_flight: config.max_concurrent_connections,
            max_command_chars: config.max_command_chars,
            cancel: CancellationToken::new(),
            pool,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use an externally owned token, e.g. one shared with a signal handler
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the running batch
    ///
    /// Unfinished requests report `Cancelled`. The token stays cancelled, so
    /// later batches on this dispatcher are cancelled immediately.
    pub fn cancel(&self) {
        info!("Cancelling dispatched requests");
        self.cancel.cancel();
    }

    /// Run every request and collect one result per request, in input order
    ///
    /// Requests for one endpoint run one after another on a single worker, so
    /// they never wait on each other inside the pool. Workers for distinct
    /// endpoints run in parallel, at most `max_concurrent_connections` at a
    /// time.
    pub async fn run_batch(&self, requests: Vec<Request>) -> Vec<OperationResult> {
        info!("Dispatching batch of {} requests", requests.len());
        let limiter = Arc::new(Semaphore::new(self.max_in_flight.max(1)));

        let labels: Vec<(EndpointId, Operation)> = requests
            .iter()
            .map(|request| (request.endpoint.id(), request.operation.clone()))
            .collect();

        let mut groups: Vec<Vec<(usize, Request)>> = Vec::new();
        let mut group_of: HashMap<EndpointId, usize> = HashMap::new();
        for (index, request) in requests.into_iter().enumerate() {
            let group = *group_of.entry(request.endpoint.id()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push((index, request));
        }
        debug!("Batch spans {} endpoints", groups.len());

        let (members, tasks): (Vec<Vec<usize>>, Vec<_>) = groups
            .into_iter()
            .map(|group| {
                let indices = group.iter().map(|(index, _)| *index).collect();
                let worker = self.clone();
                let limiter = Arc::clone(&limiter);
                let task = tokio::spawn(async move {
                    let mut results = Vec::with_capacity(group.len());
                    for (index, request) in group {
                        results.push((index, worker.process(request, &limiter).await));
                    }
                    results
                });
                (indices, task)
            })
            .unzip();

        let mut slots: Vec<Option<OperationResult>> = labels.iter().map(|_| None).collect();
        for (indices, joined) in members.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(results) => {
                    for (index, result) in results {
                        slots[index] = Some(result);
                    }
                }
                Err(e) => {
                    let panicked = e.is_panic();
                    if panicked {
                        error!("Request worker panicked: {}", e);
                    }
                    for index in indices {
                        let (endpoint, operation) = labels[index].clone();
                        let err = if panicked {
                            FleetError::Internal(format!("request task panicked: {}", e))
                        } else {
                            FleetError::Cancelled
                        };
                        let result = OperationResult::new(endpoint, operation, Err(err), 0);
                        slots[index] = Some(result);
                    }
                }
            }
        }

        let results: Vec<OperationResult> = slots
            .into_iter()
            .zip(labels)
            .map(|(slot, (endpoint, operation))| {
                slot.unwrap_or_else(|| {
                    OperationResult::new(endpoint, operation, Err(FleetError::Cancelled), 0)
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            "Batch finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    /// Run one request to completion, honouring cancellation
    pub async fn run_one(&self, request: Request) -> OperationResult {
        let limiter = Semaphore::new(1);
        self.process(request, &limiter).await
    }

    async fn process(&self, request: Request, limiter: &Semaphore) -> OperationResult {
        let endpoint = request.endpoint.id();

        if let Err(err) = request.operation.validate(self.max_command_chars) {
            warn!("Rejected {} for {}: {}", request.operation, endpoint, err);
            return OperationResult::new(endpoint, request.operation, Err(err), 0);
        }

        let mut attempts = 0;
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FleetError::Cancelled),
            result = self.run_with_retries(&request, limiter, &mut attempts) => result,
        };

        match &result {
            Ok(_) => debug!("{} on {} succeeded", request.operation, endpoint),
            Err(err) => warn!("{} on {} failed: {}", request.operation, endpoint, err),
        }
        OperationResult::new(endpoint, request.operation, result, attempts)
    }

    async fn run_with_retries(
        &self,
        request: &Request,
        limiter: &Semaphore,
        attempts: &mut u32,
    ) -> Result<CommandOutput> {
        loop {
            let permit = limiter
                .acquire()
                .await
                .map_err(|_| FleetError::Cancelled)?;
            *attempts += 1;
            let outcome = self.attempt(request).await;
            drop(permit);

            let err = match outcome {
                Ok(output) => return Ok(output),
                Err(AttemptError::Acquire(err)) => return Err(err),
                Err(AttemptError::Run(err)) => err,
            };

            match self.retry.delay_for_attempt(*attempts - 1) {
                Some(delay) if err.is_retryable() => {
                    warn!(
                        "{} on {} failed (attempt {}/{}): {}; retrying in {}ms",
                        request.operation,
                        request.endpoint,
                        attempts,
                        self.retry.max_attempts(),
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    async fn attempt(&self, request: &Request) -> std::result::Result<CommandOutput, AttemptError> {
        let mut session = self
            .pool
            .acquire(&request.endpoint)
            .await
            .map_err(AttemptError::Acquire)?;

        let result = session.run(&request.operation).await;
        session.release();
        result.map_err(AttemptError::Run)
    }
}
