pub mod collector;
pub mod config;
pub mod error;
pub mod event;
pub mod postgres;
pub mod processor;
pub mod sink;

pub use collector::{Backoff, Collector};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{DataChangeEvent, Field, FieldType, FieldValue, Transaction};
pub use processor::Processor;
pub use sink::Sink;
