//! Orchestrates the long-running process tasks of a service binary:
//! concurrent named processes sharing one cancellation token, SIGINT/SIGTERM
//! handling, and cleanup closers that run regardless of how the processes
//! ended. `run` returns the process exit code instead of exiting, so the
//! binary stays in charge of termination.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type ProcessFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// A long-running task driven by the shared cancellation token.
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;

/// A cleanup function executed after all processes have stopped.
pub type Closer = Box<dyn FnOnce() -> ProcessFuture + Send>;

pub struct Runner {
    processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            token: CancellationToken::new(),
        }
    }

    /// Add a named process. If any process fails, every other process is
    /// cancelled and the runner reports a non-zero exit code.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Add a cleanup function; closers run after the processes stop, each
    /// attempt bounded by the closer timeout as a group.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally controlled cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Run everything to completion and return the exit code: 0 when all
    /// processes stopped cleanly, 1 when any of them failed.
    pub async fn run(self) -> i32 {
        let token = self.token;
        let mut join_set: JoinSet<(String, Result<(), anyhow::Error>)> = JoinSet::new();

        for (name, process) in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                let result = process(process_token).await;
                (name, result)
            });
        }

        spawn_signal_handlers(token.clone());

        let mut failed = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "process completed");
                }
                Ok((name, Err(err))) => {
                    error!(process = %name, error = format!("{err:#}"), "process failed");
                    failed = true;
                    token.cancel();
                }
                Err(err) => {
                    error!(error = %err, "process panicked");
                    failed = true;
                    token.cancel();
                }
            }
        }

        if !self.closers.is_empty() {
            info!(timeout = ?self.closer_timeout, "running closers");
            let closers = run_closers(self.closers);
            if tokio::time::timeout(self.closer_timeout, closers)
                .await
                .is_err()
            {
                error!("closers timed out");
            }
        }

        if failed {
            1
        } else {
            info!("all processes stopped cleanly");
            0
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal");
            ctrl_c_token.cancel();
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut join_set = JoinSet::new();
    for closer in closers {
        join_set.spawn(closer());
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(())) => debug!("closer completed"),
            Ok(Err(err)) => error!(error = format!("{err:#}"), "closer failed"),
            Err(err) => error!(error = %err, "closer panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn clean_shutdown_returns_zero() {
        let token = CancellationToken::new();
        let canceller = token.clone();

        let code = Runner::new()
            .with_cancellation_token(token)
            .with_named_process("worker", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_named_process("canceller", move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                canceller.cancel();
                Ok(())
            })
            .run()
            .await;

        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn failing_process_cancels_the_rest_and_returns_one() {
        let code = Runner::new()
            .with_named_process("worker", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_named_process("faulty", |_ctx| async move {
                Err(anyhow::anyhow!("dependency lost"))
            })
            .run()
            .await;

        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn closers_run_after_processes_stop() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&closed);

        let code = Runner::new()
            .with_named_process("worker", |_ctx| async move { Ok(()) })
            .with_closer(move || async move {
                closed_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_closer_timeout(Duration::from_secs(1))
            .run()
            .await;

        assert_eq!(code, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn hung_closer_is_bounded_by_the_timeout() {
        let code = Runner::new()
            .with_named_process("worker", |_ctx| async move { Ok(()) })
            .with_closer(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .with_closer_timeout(Duration::from_millis(50))
            .run()
            .await;

        assert_eq!(code, 0);
    }
}
