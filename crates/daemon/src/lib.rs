/// exitpool daemon library
///
/// Concrete collaborators for the pool: the control-port client, the bundled
/// fetch worker and the logging statistics reporter.

pub mod control;
pub mod fetch_worker;
pub mod stats;

pub use control::TorControlLink;
pub use fetch_worker::{FetchWorker, FetchWorkerFactory};
pub use stats::LogStatistics;
