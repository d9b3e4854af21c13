use super::status::ReleaseStatus;
use super::{
    ActionKind, ProgressSink, ReleaseAction, ReleaseContext, ReleaseError, ReleaseKind,
    ReleaseOutcome, ReleaseRequest, Releaser,
};
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

impl Releaser {
    /// Run `actions` in order, recording each result on the action
    ///
    /// Stops at the first failing action; the actions after it keep
    /// `result == None`. In [`ReleaseKind::Plan`] mode nothing is run.
    pub async fn execute(
        &self,
        actions: &mut [ReleaseAction],
        kind: ReleaseKind,
        progress: &dyn ProgressSink,
    ) -> Result<ReleaseStatus, ReleaseError> {
        let mut status = ReleaseStatus::NotStarted;
        status.transition(ReleaseStatus::Running)?;

        // Dropping the context removes the checkout
        let mut rc = match kind {
            ReleaseKind::Execute => Some(ReleaseContext::new()?),
            ReleaseKind::Plan => None,
        };

        for action in actions.iter_mut() {
            progress.report(&action.description);
            info!(action = action.name(), "{}", action.description);

            let Some(rc) = rc.as_mut() else {
                continue;
            };
            if action.kind == ActionKind::Note {
                continue;
            }

            let start = Instant::now();
            let result = action.kind.run(&self.env, rc).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    debug!(action = action.name(), duration_ms, success = true, "Action finished");
                    if !output.is_empty() {
                        progress.report(&output);
                    }
                    action.result = Some(output);
                }
                Err(e) => {
                    warn!(action = action.name(), duration_ms, success = false, error = %e, "Action failed");
                    progress.report(&e.to_string());
                    action.result = Some(format!("Failed: {}", e));
                    status.transition(ReleaseStatus::Failed)?;
                    return Err(e);
                }
            }
        }

        status.transition(ReleaseStatus::Succeeded)?;
        Ok(status)
    }

    /// Plan and run one release request
    ///
    /// A release that fails while running comes back as
    /// [`ReleaseError::Failed`], carrying the outcome up to the failing action.
    pub async fn handle(
        &self,
        request: &ReleaseRequest,
        progress: &dyn ProgressSink,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let id = Uuid::new_v4();
        let span = info_span!("release", %id, kind = %request.kind);

        async {
            let start = Instant::now();
            progress.report("Calculating release actions.");

            let (release_type, mut actions) = match self.plan(request, progress).await {
                Ok(plan) => plan,
                Err(e) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    warn!(duration_ms, success = false, error = %e, "Release planning failed");
                    return Err(e);
                }
            };

            let result = self.execute(&mut actions, request.kind, progress).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            info!(
                release_type = %release_type,
                duration_ms,
                success = result.is_ok(),
                "Release finished"
            );

            match result {
                Ok(status) => Ok(ReleaseOutcome {
                    id,
                    release_type,
                    actions,
                    status,
                }),
                Err(e) => Err(ReleaseError::Failed {
                    outcome: Box::new(ReleaseOutcome {
                        id,
                        release_type,
                        actions,
                        status: ReleaseStatus::Failed,
                    }),
                    source: Box::new(e),
                }),
            }
        }
        .instrument(span)
        .await
    }
}
