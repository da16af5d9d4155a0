use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::pipeline::TaskLedger;

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args.cache_root.join("docsplit_ledger.sqlite");

    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "ledger missing, no tasks recorded yet");
        return Ok(());
    }

    let ledger = TaskLedger::open(&db_path)?;

    let counts = ledger.status_counts()?;
    if counts.is_empty() {
        info!("ledger is empty");
    }
    for (status, count) in counts {
        info!(status = %status, count, "tasks by status");
    }

    for row in ledger.recent_tasks(args.limit)? {
        info!(
            correlation_key = %row.correlation_key,
            status = %row.status.as_str(),
            attempts = row.attempts,
            success_notified = row.success_notified,
            failure_notified = row.failure_notified,
            results = %row.results_reference.unwrap_or_default(),
            last_error = %row.last_error.unwrap_or_default(),
            updated_at = %row.updated_at,
            "task"
        );
    }

    Ok(())
}
