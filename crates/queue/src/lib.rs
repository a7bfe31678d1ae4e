pub mod admin;
pub mod consumer;
pub mod error;
pub mod parser;
pub mod sqs;

pub use admin::{QueueStatus, SqsAdmin};
pub use consumer::{QueueConsumer, QueueHealth, QueueMessage};
pub use error::QueueError;
pub use parser::{parse_work_item, WorkMessage};
pub use sqs::SqsConsumer;
