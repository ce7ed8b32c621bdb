//! conductor: line-oriented command runner
//!
//! Reads one JSON `CommandRequest` per line from stdin and writes one JSON
//! `CommandResponse` per line to stdout. Logs go to stderr.
//!
//! ```text
//! $ echo '{"command":"state.increment","subject":"alice","parameters":{"entityType":"counter","entityId":"a"}}' | conductor
//! {"success":true,"result":1,"metadata":{...}}
//! ```
//!
//! ## Configuration
//! Optional first argument: path to a YAML config file. Otherwise
//! `conductor.yaml`, `CONDUCTOR_CONFIG` and `CONDUCTOR__*` variables apply.
//!
//! ```yaml
//! rate_limits:
//!   - category: write
//!     window_ms: 60000
//!     max_requests: 5
//! commands:
//!   state.set:
//!     rate_limit_class: write
//!     hooks:
//!       - { name: sql_guard, phase: pre, mode: blocking }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use conductor::builtin;
use conductor::config::Config;
use conductor::orchestrator::{CommandRequest, OrchestratorBuilder};
use conductor::queue::LoggingDeadLetterSink;
use conductor::utils::bootstrap::init_tracing;

/// How long to wait for pending events once stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let mut builder = OrchestratorBuilder::with_config(config)
        .commands(builtin::commands())
        .event_handler(builtin::STATE_CHANGED, Arc::new(builtin::LogEvents))
        .dead_letter_sink(Arc::new(LoggingDeadLetterSink));
    for hook in builtin::hooks() {
        builder = builder.hook(hook);
    }
    let orchestrator = builder.build()?;

    info!(commands = ?orchestrator.registry().names(), "conductor ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let output = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => serde_json::to_string(&orchestrator.execute(request).await)?,
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                json!({
                    "success": false,
                    "error": { "kind": "InvalidRequest", "message": e.to_string() },
                })
                .to_string()
            }
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while orchestrator.queue().stats().pending > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Event queue not drained before shutdown");
    }
    orchestrator.shutdown().await;
    info!(stats = ?orchestrator.queue().stats(), "conductor stopped");
    Ok(())
}
