//! Tracing instrumentation for tuna.
//!
//! Helper functions for creating tracing spans around the job and trial
//! lifecycle. Subscriber installation is the embedding application's
//! responsibility; these helpers only shape the spans.

use tracing::{info_span, Span};

/// Span covering the submission of one job to a backend.
#[must_use]
pub fn job_submit_span(job_id: impl AsRef<str>, runner: impl AsRef<str>) -> Span {
    info_span!(
        "tuna.submit",
        job_id = %job_id.as_ref(),
        runner = %runner.as_ref(),
    )
}

/// Span covering one backend status poll for a job.
#[must_use]
pub fn job_poll_span(job_id: impl AsRef<str>, runner: impl AsRef<str>) -> Span {
    info_span!(
        "tuna.poll",
        job_id = %job_id.as_ref(),
        runner = %runner.as_ref(),
    )
}

/// Span covering the dispatch of one trial.
#[must_use]
pub fn trial_dispatch_span(trial_id: impl AsRef<str>) -> Span {
    info_span!(
        "tuna.trial_dispatch",
        trial_id = %trial_id.as_ref(),
    )
}

/// Span covering one monitoring pass over outstanding trials.
#[must_use]
pub fn monitor_pass_span(outstanding: usize) -> Span {
    info_span!("tuna.monitor", outstanding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_carry_their_names() {
        // Spans are disabled without a subscriber, but construction must
        // not panic and metadata must be present when enabled.
        let _ = job_submit_span("job-1", "local-pool");
        let _ = job_poll_span("job-1", "slurm");
        let _ = trial_dispatch_span("trial-0");
        let _ = monitor_pass_span(3);
    }
}
