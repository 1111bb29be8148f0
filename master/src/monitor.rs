use std::time::{Duration, SystemTime};

use chrono::Utc;
use common::JobState;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::state::AppState;
use crate::MONITOR_SWEEP_INTERVAL_MS;

/// Loop de fondo: los jobs con la entrada cerrada pasan a `done` una vez que
/// transcurre `state.settle`.
pub async fn run_monitor_loop(state: AppState) {
    loop {
        sleep(Duration::from_millis(MONITOR_SWEEP_INTERVAL_MS)).await;

        match sweep_once(&state, SystemTime::now()) {
            Ok(0) => {}
            Ok(n) => debug!("{} jobs terminados en esta pasada", n),
            Err(e) => warn!("error en monitor sweep: {:?}", e),
        }
    }
}

/// Una pasada: marca `done` los jobs `running` cuya entrada se cerró hace al
/// menos `settle`. Devuelve cuántos cambiaron.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Result<usize, String> {
    let mut jobs = state.jobs.lock().map_err(|_| "lock jobs")?;
    let mut done = 0;

    for (id, record) in jobs.iter_mut() {
        if record.info.state != JobState::Running {
            continue;
        }
        let Some(ended_at) = record.ended_at else {
            continue;
        };

        match now.duration_since(ended_at) {
            Ok(elapsed) if elapsed >= state.settle => {
                record.info.state = JobState::Done;
                record.info.finished_at = Some(Utc::now());
                info!("job {} terminado ({} claves)", id, record.info.keys);
                done += 1;
            }
            // todavía asentándose, o ended_at en el futuro
            _ => continue,
        }
    }

    Ok(done)
}
