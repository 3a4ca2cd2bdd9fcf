pub mod aggregate;
pub mod coordinator;
pub mod notifier;
pub mod scanner;
pub mod worker;

pub use aggregate::compute_aggregate;
pub use coordinator::BatchCoordinator;
pub use notifier::{LogNotifier, Notifier};
pub use scanner::Scanner;
pub use worker::{RetryPolicy, ScanWorker};
