//! Daemon Server Implementation
//!
//! The serve loop for the router daemon:
//! - Reads one JSON request per input line
//! - Spawns a task per request against the shared [`Orchestrator`]
//! - Writes each response as a single JSON line, in completion order
//! - On shutdown stops intake, cancels in-flight requests and drains
//!   their (cancelled) responses before returning
//!
//! ```text
//!   stdin ──lines──> serve loop ──spawn──> request task ─┐
//!                        ^                                │
//!                        └────────── mpsc <───────────────┘
//!                        │
//!                        v
//!                     stdout
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nexus_core::{
    AdapterFactory, GenerateRequest, GenerateResponse, HttpAdapterFactory, Orchestrator,
    PerformanceLedger, RouterConfig,
};

/// Responses buffered between request tasks and the writer
const RESPONSE_CHANNEL_CAPACITY: usize = 256;

/// One input line
#[derive(Debug, Deserialize)]
struct RequestLine {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(flatten)]
    request: GenerateRequest,
}

/// One output line for a routed request
#[derive(Debug, Serialize)]
struct ResponseLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    #[serde(flatten)]
    response: GenerateResponse,
}

/// One output line for input that could not be parsed
#[derive(Debug, Serialize)]
struct RejectionLine {
    success: bool,
    error: Rejection,
}

#[derive(Debug, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
enum Rejection {
    InvalidRequest { message: String },
}

/// Counters reported when the serve loop ends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub received: u64,
    pub answered: u64,
}

/// The router daemon
pub struct DaemonServer {
    router: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl DaemonServer {
    /// Load the ledger, build the router with HTTP adapters and start its
    /// background tasks
    pub async fn start(config: &RouterConfig, shutdown: CancellationToken) -> Result<Self> {
        let factory = HttpAdapterFactory::new().context("Failed to create HTTP client")?;
        Self::start_with_factory(config, Arc::new(factory), shutdown).await
    }

    pub async fn start_with_factory(
        config: &RouterConfig,
        factory: Arc<dyn AdapterFactory>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let alpha = config.tuning.ema_alpha;
        let ledger = match config.persistence.path {
            Some(ref path) => PerformanceLedger::load(path, alpha)
                .await
                .with_context(|| format!("Failed to load performance ledger: {path:?}"))?,
            None => PerformanceLedger::new(alpha),
        };
        info!(records = ledger.len(), "Performance ledger ready");

        let router = Arc::new(Orchestrator::new(config, Arc::new(ledger), factory));
        router.spawn_background();

        Ok(Self { router, shutdown })
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Orchestrator> {
        &self.router
    }

    /// Serve requests until the input closes or shutdown is requested
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> Result<ServeStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<String>(RESPONSE_CHANNEL_CAPACITY);
        let mut lines = input.lines();
        let mut stats = ServeStats::default();

        info!("Ready to accept requests");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Shutdown requested, closing intake");
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        stats.received += 1;
                        self.dispatch(line, tx.clone());
                    }
                    Ok(None) => {
                        debug!("Input closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read input, closing intake");
                        break;
                    }
                },
                Some(out) = rx.recv() => {
                    write_line(&mut output, &out).await?;
                    stats.answered += 1;
                }
            }
        }

        // Drain in-flight requests
        drop(tx);
        while let Some(out) = rx.recv().await {
            write_line(&mut output, &out).await?;
            stats.answered += 1;
        }

        Ok(stats)
    }

    fn dispatch(&self, line: String, tx: mpsc::Sender<String>) {
        let router = Arc::clone(&self.router);
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let out = match serde_json::from_str::<RequestLine>(&line) {
                Ok(RequestLine { id, request }) => {
                    let response = router.generate_text_with_cancel(request, &cancel).await;
                    encode(&ResponseLine { id, response })
                }
                Err(e) => {
                    warn!(error = %e, "Rejected malformed request line");
                    encode(&RejectionLine {
                        success: false,
                        error: Rejection::InvalidRequest {
                            message: e.to_string(),
                        },
                    })
                }
            };

            if tx.send(out).await.is_err() {
                debug!("Response channel closed before delivery");
            }
        });
    }

    /// Stop background tasks and write the final checkpoint
    pub async fn shutdown(&self) -> Result<()> {
        self.router
            .shutdown()
            .await
            .context("Failed to write final ledger checkpoint")
    }
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        format!(r#"{{"success":false,"error":{{"reason":"internal","message":"{e}"}}}}"#)
    })
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
