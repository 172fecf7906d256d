//! Control-liveness probe timer (spec §4.C "Control-liveness probe",
//! §9 "Timers with `unref()`-like semantics"). Scheduling is a plain
//! `tokio::spawn` + `sleep` that posts a command back into the owning
//! session's actor loop — the actor re-checks the live condition at fire
//! time, so a probe that fires after the thing it was watching for already
//! happened is a harmless no-op (idempotent on re-arm, per spec §5).

use std::time::Duration;

use tokio::sync::mpsc;

use crate::relay::session::{ProbeStage, SessionCommand};

pub fn schedule(
    self_tx: mpsc::Sender<SessionCommand>,
    connection_id: String,
    stage: ProbeStage,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = self_tx
            .send(SessionCommand::ProbeTick {
                connection_id,
                stage,
            })
            .await;
    });
}
