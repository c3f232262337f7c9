//! Interactive query service access and the query wait primitive.
//!
//! [`QueryService`] is a thin seam over Athena. Every wait for a query goes
//! through [`wait_for_query`], which polls at a fixed interval, gives up at
//! a wall-clock deadline and can be aborted through a
//! [`CancellationToken`]. [`QueryRunner`] bundles the database, the result
//! location and the wait settings for callers that just want rows back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_athena::types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::error::QueryError;

/// Default deadline for a single query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default delay between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle state of a query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Waiting to run
    Queued,
    /// Running
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped before finishing
    Cancelled,
}

impl QueryState {
    /// Returns `true` for states a query never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// State of a query plus the service's explanation, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    /// Current state
    pub state: QueryState,
    /// State change reason reported by the service
    pub reason: Option<String>,
}

impl QueryStatus {
    /// Status without a reason.
    #[must_use]
    pub fn new(state: QueryState) -> Self {
        Self { state, reason: None }
    }
}

/// Rows returned by a finished query, header row removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResults {
    /// Column labels
    pub columns: Vec<String>,
    /// Data rows; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
}

/// Interactive query service.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Submits `sql` and returns the execution identifier.
    async fn start_query(
        &self,
        sql: &str,
        database: &str,
        output_location: &str,
    ) -> Result<String, QueryError>;

    /// Current status of an execution.
    async fn get_status(&self, execution_id: &str) -> Result<QueryStatus, QueryError>;

    /// Results of a succeeded execution.
    async fn get_results(&self, execution_id: &str) -> Result<QueryResults, QueryError>;

    /// Asks the service to stop an execution.
    async fn stop_query(&self, execution_id: &str) -> Result<(), QueryError>;
}

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Give up after this much time
    pub deadline: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_QUERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitOptions {
    /// Wait settings from the sink configuration.
    #[must_use]
    pub fn from_config(sink: &SinkConfig) -> Self {
        Self {
            deadline: sink.query_timeout,
            poll_interval: sink.poll_interval,
        }
    }
}

/// Polls `execution_id` until it reaches a terminal state.
///
/// # Errors
///
/// - [`QueryError::Timeout`] when `options.deadline` passes first; the
///   execution is asked to stop before returning.
/// - [`QueryError::Aborted`] when `cancel` fires; the execution is asked
///   to stop as well.
/// - Any error from [`QueryService::get_status`].
pub async fn wait_for_query(
    service: &dyn QueryService,
    execution_id: &str,
    options: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<QueryStatus, QueryError> {
    let started = Instant::now();
    let deadline = started + options.deadline;
    loop {
        let status = service.get_status(execution_id).await?;
        if status.state.is_terminal() {
            debug!(execution_id, state = ?status.state, "query finished");
            return Ok(status);
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(execution_id, "query deadline passed, stopping execution");
            stop_quietly(service, execution_id).await;
            return Err(QueryError::Timeout {
                execution_id: execution_id.to_string(),
                waited_ms: now.duration_since(started).as_millis(),
            });
        }

        let pause = options.poll_interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => {
                info!(execution_id, "wait aborted, stopping execution");
                stop_quietly(service, execution_id).await;
                return Err(QueryError::Aborted {
                    execution_id: execution_id.to_string(),
                });
            }
            () = tokio::time::sleep(pause) => {}
        }
    }
}

async fn stop_quietly(service: &dyn QueryService, execution_id: &str) {
    if let Err(e) = service.stop_query(execution_id).await {
        warn!(execution_id, error = %e, "failed to stop query");
    }
}

/// Runs queries against one database and result location.
#[derive(Clone)]
pub struct QueryRunner {
    service: Arc<dyn QueryService>,
    database: String,
    output_location: String,
    wait: WaitOptions,
    cancel: CancellationToken,
}

impl QueryRunner {
    /// Creates a runner.
    pub fn new(
        service: Arc<dyn QueryService>,
        database: impl Into<String>,
        output_location: impl Into<String>,
    ) -> Self {
        Self {
            service,
            database: database.into(),
            output_location: output_location.into(),
            wait: WaitOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the wait options.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitOptions) -> Self {
        self.wait = wait;
        self
    }

    /// Set the cancellation token shared with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Database the queries run in.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Starts `sql`, waits for it and fetches its rows.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Failed`] or [`QueryError::Cancelled`] for
    /// those terminal states, and any error from [`wait_for_query`].
    pub async fn run(&self, sql: &str) -> Result<QueryResults, QueryError> {
        let execution_id = self
            .service
            .start_query(sql, &self.database, &self.output_location)
            .await?;
        debug!(execution_id = %execution_id, sql, "query started");

        let status =
            wait_for_query(self.service.as_ref(), &execution_id, &self.wait, &self.cancel).await?;
        match status.state {
            QueryState::Succeeded => self.service.get_results(&execution_id).await,
            QueryState::Failed => Err(QueryError::Failed {
                execution_id,
                reason: status.reason.unwrap_or_else(|| "unknown".to_string()),
            }),
            QueryState::Cancelled => Err(QueryError::Cancelled { execution_id }),
            QueryState::Queued | QueryState::Running => Err(QueryError::Malformed(format!(
                "query {execution_id} returned while {:?}",
                status.state
            ))),
        }
    }
}

/// [`QueryService`] backed by Amazon Athena.
#[derive(Debug, Clone)]
pub struct AthenaQueryService {
    client: aws_sdk_athena::Client,
}

impl AthenaQueryService {
    /// Wraps an Athena client.
    #[must_use]
    pub fn new(client: aws_sdk_athena::Client) -> Self {
        Self { client }
    }
}

fn service_error<E>(e: E) -> QueryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    QueryError::Service(Box::new(e))
}

#[async_trait]
impl QueryService for AthenaQueryService {
    async fn start_query(
        &self,
        sql: &str,
        database: &str,
        output_location: &str,
    ) -> Result<String, QueryError> {
        let output = self
            .client
            .start_query_execution()
            .query_string(sql)
            .query_execution_context(QueryExecutionContext::builder().database(database).build())
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(output_location)
                    .build(),
            )
            .send()
            .await
            .map_err(service_error)?;
        output
            .query_execution_id()
            .map(str::to_string)
            .ok_or_else(|| QueryError::Malformed("missing query execution id".to_string()))
    }

    async fn get_status(&self, execution_id: &str) -> Result<QueryStatus, QueryError> {
        let output = self
            .client
            .get_query_execution()
            .query_execution_id(execution_id)
            .send()
            .await
            .map_err(service_error)?;
        let status = output
            .query_execution()
            .and_then(|q| q.status())
            .ok_or_else(|| QueryError::Malformed(format!("no status for {execution_id}")))?;
        let state = match status.state() {
            Some(QueryExecutionState::Queued) => QueryState::Queued,
            Some(QueryExecutionState::Running) => QueryState::Running,
            Some(QueryExecutionState::Succeeded) => QueryState::Succeeded,
            Some(QueryExecutionState::Failed) => QueryState::Failed,
            Some(QueryExecutionState::Cancelled) => QueryState::Cancelled,
            other => {
                return Err(QueryError::Malformed(format!(
                    "unexpected state {other:?} for {execution_id}"
                )));
            },
        };
        Ok(QueryStatus {
            state,
            reason: status.state_change_reason().map(str::to_string),
        })
    }

    async fn get_results(&self, execution_id: &str) -> Result<QueryResults, QueryError> {
        let mut results = QueryResults::default();
        let mut next_token: Option<String> = None;
        let mut first_page = true;
        loop {
            let output = self
                .client
                .get_query_results()
                .query_execution_id(execution_id)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(service_error)?;
            let Some(result_set) = output.result_set() else {
                break;
            };
            if first_page {
                results.columns = result_set
                    .result_set_metadata()
                    .map(|m| {
                        m.column_info()
                            .iter()
                            .map(|c| c.name().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
            }
            for (index, row) in result_set.rows().iter().enumerate() {
                let values: Vec<Option<String>> = row
                    .data()
                    .iter()
                    .map(|d| d.var_char_value().map(str::to_string))
                    .collect();
                let is_header = first_page
                    && index == 0
                    && !results.columns.is_empty()
                    && values
                        .iter()
                        .map(Option::as_deref)
                        .eq(results.columns.iter().map(|c| Some(c.as_str())));
                if !is_header {
                    results.rows.push(values);
                }
            }
            first_page = false;
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(results)
    }

    async fn stop_query(&self, execution_id: &str) -> Result<(), QueryError> {
        self.client
            .stop_query_execution()
            .query_execution_id(execution_id)
            .send()
            .await
            .map_err(service_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns scripted states, then repeats the last one forever.
    struct ScriptedService {
        states: Mutex<VecDeque<QueryStatus>>,
        polls: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ScriptedService {
        fn new(states: Vec<QueryStatus>) -> Self {
            Self {
                states: Mutex::new(states.into()),
                polls: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueryService for ScriptedService {
        async fn start_query(&self, _: &str, _: &str, _: &str) -> Result<String, QueryError> {
            Ok("q-1".to_string())
        }

        async fn get_status(&self, _: &str) -> Result<QueryStatus, QueryError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                Ok(states.pop_front().unwrap())
            } else {
                Ok(states.front().cloned().unwrap())
            }
        }

        async fn get_results(&self, _: &str) -> Result<QueryResults, QueryError> {
            Ok(QueryResults {
                columns: vec!["n".to_string()],
                rows: vec![vec![Some("3".to_string())]],
            })
        }

        async fn stop_query(&self, _: &str) -> Result<(), QueryError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options() -> WaitOptions {
        WaitOptions {
            deadline: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_terminal_status() {
        let service = ScriptedService::new(vec![
            QueryStatus::new(QueryState::Queued),
            QueryStatus::new(QueryState::Running),
            QueryStatus::new(QueryState::Succeeded),
        ]);
        let status = wait_for_query(&service, "q-1", &options(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status.state, QueryState::Succeeded);
        assert_eq!(service.polls.load(Ordering::SeqCst), 3);
        assert_eq!(service.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_stops_query() {
        let service = ScriptedService::new(vec![QueryStatus::new(QueryState::Running)]);
        let err = wait_for_query(&service, "q-1", &options(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            QueryError::Timeout { waited_ms, .. } => assert!(waited_ms >= 10_000),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        // one poll at start plus one per second until the deadline
        assert_eq!(service.polls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_can_be_aborted() {
        let service = ScriptedService::new(vec![QueryStatus::new(QueryState::Running)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for_query(&service, "q-1", &options(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Aborted { .. }));
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_maps_terminal_states() {
        let failed = Arc::new(ScriptedService::new(vec![QueryStatus {
            state: QueryState::Failed,
            reason: Some("SYNTAX_ERROR".to_string()),
        }]));
        let runner = QueryRunner::new(failed, "db", "s3://out/").with_wait(options());
        match runner.run("SELECT 1").await {
            Err(QueryError::Failed { reason, .. }) => assert_eq!(reason, "SYNTAX_ERROR"),
            other => panic!("expected failure, got {other:?}"),
        }

        let cancelled = Arc::new(ScriptedService::new(vec![QueryStatus::new(
            QueryState::Cancelled,
        )]));
        let runner = QueryRunner::new(cancelled, "db", "s3://out/");
        assert!(matches!(
            runner.run("SELECT 1").await,
            Err(QueryError::Cancelled { .. })
        ));

        let ok = Arc::new(ScriptedService::new(vec![QueryStatus::new(
            QueryState::Succeeded,
        )]));
        let results = QueryRunner::new(ok, "db", "s3://out/")
            .run("SELECT 1")
            .await
            .unwrap();
        assert_eq!(results.rows, vec![vec![Some("3".to_string())]]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!QueryState::Queued.is_terminal());
        assert!(!QueryState::Running.is_terminal());
        assert!(QueryState::Succeeded.is_terminal());
        assert!(QueryState::Failed.is_terminal());
        assert!(QueryState::Cancelled.is_terminal());
    }
}
