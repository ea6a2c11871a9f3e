//! Runs the same supervised operation several times in a row.
use crate::outcome::Outcome;
use crate::progress::ProgressSample;
use crate::request::OperationRequest;
use crate::supervisor::Supervisor;

/// Runs `pass_count` passes in order, building each request with
/// `request_for(pass_index)`.
///
/// Samples handed to `on_progress` are tagged with their pass, so
/// [`ProgressSample::overall_percentage`] gives the position in the whole
/// sequence. The first pass that does not succeed ends the sequence and its
/// outcome is returned unchanged. Passes already completed are not undone.
pub fn run_passes<R, F>(
    supervisor: &Supervisor,
    pass_count: usize,
    mut request_for: R,
    mut on_progress: F,
) -> Outcome
where
    R: FnMut(usize) -> OperationRequest,
    F: FnMut(ProgressSample),
{
    for pass in 0..pass_count {
        if supervisor.cancel_token().is_cancelled() {
            log::info!("Stopping before pass {}/{}: cancelled", pass + 1, pass_count);
            return Outcome::Cancelled;
        }

        log::info!("Starting pass {}/{}", pass + 1, pass_count);
        let request = request_for(pass);
        let outcome = supervisor.run(request, |sample| {
            on_progress(sample.in_pass(pass, pass_count))
        });

        if !outcome.is_success() {
            log::warn!("Pass {}/{} {}", pass + 1, pass_count, outcome);
            return outcome;
        }
    }
    Outcome::Succeeded
}
