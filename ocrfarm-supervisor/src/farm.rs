//! Runs the conductor and the pause scheduler side by side

use crate::conductor::FarmConductor;
use crate::pause::PauseScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the conductor and, if given, the scheduler as separate tasks.
///
/// Returns once both have stopped. A panicking conductor cancels `token` so
/// the scheduler does not outlive it.
pub async fn run_farm(
    mut conductor: FarmConductor,
    scheduler: Option<PauseScheduler>,
    token: CancellationToken,
) {
    let conductor_token = token.clone();
    let conductor_task = tokio::spawn(async move {
        conductor.run(conductor_token).await;
    });

    let scheduler_task = match scheduler {
        Some(scheduler) => {
            let scheduler_token = token.clone();
            Some(tokio::spawn(async move {
                scheduler.run(scheduler_token).await;
            }))
        }
        None => {
            info!("Pause scheduler disabled");
            None
        }
    };

    if let Err(e) = conductor_task.await {
        error!("Conductor task failed: {}", e);
        token.cancel();
    }
    if let Some(task) = scheduler_task
        && let Err(e) = task.await
    {
        error!("Pause scheduler task failed: {}", e);
    }
}
