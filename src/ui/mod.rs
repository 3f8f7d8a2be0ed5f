pub mod progress;
pub mod report;

pub use progress::{create_spinner, fail_spinner, finish_spinner};
pub use report::{print_processing_result, print_validation_report};
