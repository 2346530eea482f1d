//! Console reporting of upload events.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chunkup_uploader::{TaskStatus, TaskSummary, UploadEvent};

/// Progress is logged in steps of this many percent.
const PROGRESS_STEP: f64 = 10.0;

/// Returns an observer that logs lifecycle events and coarse progress.
pub fn observer() -> impl Fn(&UploadEvent) + Send + Sync + 'static {
    let last_step: Mutex<HashMap<String, u32>> = Mutex::new(HashMap::new());

    move |event: &UploadEvent| match event {
        UploadEvent::StatusChanged { task_id, status } => {
            tracing::info!(task = %task_id, status = %status, "status changed");
        }
        UploadEvent::Progress { task_id, progress }
        | UploadEvent::ProgressReset { task_id, progress } => {
            let step = (progress / PROGRESS_STEP).floor() as u32;
            let mut last = last_step.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = last.insert(task_id.clone(), step);
            if previous != Some(step) {
                tracing::info!(task = %task_id, "{:.0}%", progress);
            }
        }
        UploadEvent::ChunkRetry {
            task_id,
            index,
            attempt,
            error,
        } => {
            tracing::warn!(task = %task_id, index, attempt, %error, "retrying chunk");
        }
        UploadEvent::Failed { task_id, error } => {
            tracing::error!(task = %task_id, %error, "upload failed");
        }
        _ => {}
    }
}

/// One-line description of a settled task.
pub fn summary_line(summary: &TaskSummary) -> String {
    let mut line = format!("{:<9} {}", summary.status.as_str(), summary.filename);
    match summary.status {
        TaskStatus::Success => {
            if let Some(file_id) = &summary.file_id {
                line.push_str(&format!("  fileID={file_id}"));
            }
            if summary.deduplicated {
                line.push_str("  (already on server)");
            }
        }
        TaskStatus::Paused => {
            line.push_str(&format!(
                "  {}/{} chunks",
                summary.uploaded_chunks, summary.chunk_total
            ));
        }
        _ => {
            if let Some(error) = &summary.error {
                line.push_str(&format!("  {error}"));
            }
        }
    }
    line
}
