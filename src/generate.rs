use anyhow::Result;

use crate::measure::Measurement;

/// Protocol shared by every level of the search pipeline.
///
/// The driver alternates `next_config` / `set_last_results` and polls
/// `is_done` in between; a generator is never pulled again once it reports
/// done. Feedback carries one entry per co-located model; a `None` entry
/// marks a run that exhausted server resources.
pub trait ConfigGenerator {
    type Config;

    fn is_done(&self) -> bool;

    fn next_config(&mut self) -> Result<Self::Config>;

    fn set_last_results(&mut self, results: &[Option<Measurement>]);
}
