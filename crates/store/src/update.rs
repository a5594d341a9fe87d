//! Status-update decision logic shared by both store backends.

use chrono::Utc;

use phoenix_core::{Error, Result, Task, TaskStatus};

use crate::TaskStatusUpdate;

/// Apply an agent-reported outcome to a task in place.
///
/// Returns `false` for an idempotent replay (identical outcome already
/// recorded, nothing to write). Transition rules:
///
/// - `running` requires an active claim (`assigned` or `running`);
/// - `completed`/`failed` require any claim (`assigned` or `running`);
/// - a terminal task accepts only its own outcome as a replay;
/// - agents may not report any other status.
pub(crate) fn apply_task_update(task: &mut Task, update: &TaskStatusUpdate) -> Result<bool> {
    if task.status == update.status
        && task.result == update.result
        && task.error_message == update.error_message
    {
        return Ok(false);
    }
    if task.status.is_terminal() {
        return Err(Error::Precondition(format!(
            "task {} is already {}",
            task.id, task.status
        )));
    }

    let now = Utc::now();
    match update.status {
        TaskStatus::Running => {
            if task.status != TaskStatus::Assigned && task.status != TaskStatus::Running {
                return Err(Error::Precondition(format!(
                    "task {} is {}, not assigned",
                    task.id, task.status
                )));
            }
            task.status = TaskStatus::Running;
            task.started_at.get_or_insert(now);
        }
        TaskStatus::Completed | TaskStatus::Failed => {
            if task.status == TaskStatus::Pending {
                return Err(Error::Precondition(format!(
                    "task {} has no active claim",
                    task.id
                )));
            }
            task.status = update.status;
            task.completed_at = Some(now);
            task.result = update.result.clone();
            task.error_message = update.error_message.clone();
        }
        other => {
            return Err(Error::Validation(format!(
                "agents may only report running, completed or failed (got {other})"
            )));
        }
    }
    task.updated_at = now;
    Ok(true)
}
