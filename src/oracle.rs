use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::{ParamMap, ResultMap};
use crate::trial::{TrialId, TrialState};

/// One line of optimization history handed to the oracle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub params: ParamMap,
    /// Metrics reported back for the trial; absent while it is in flight
    /// or if it failed.
    pub metrics: Option<ResultMap>,
    pub state: TrialState,
}

/// What the oracle answers when asked for the next parameterization.
#[derive(Clone, Debug)]
pub enum Suggestion {
    Parameters(ParamMap),
    /// The search is exhausted; no further trials will be generated.
    Exhausted,
}

/// The external parameter-suggestion engine, reduced to its four-operation
/// contract.
///
/// The scheduler treats the oracle as an injected dependency: given the
/// history so far, produce the next parameterization or declare the search
/// exhausted, accept reported metrics, and round-trip its internal state as
/// an opaque byte blob. The orchestrator imposes no schema on that blob.
pub trait Oracle: Send + Sync {
    /// Produce the next parameterization, or `Exhausted`.
    fn suggest(&mut self, history: &[TrialRecord]) -> Result<Suggestion>;

    /// Report a finished trial's metrics.
    fn report(&mut self, trial: TrialId, metrics: &ResultMap) -> Result<()>;

    /// Serialize the oracle's internal state.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Restore the oracle's internal state from a previous
    /// [`serialize`](Oracle::serialize) blob.
    fn restore(&mut self, blob: &[u8]) -> Result<()>;
}
