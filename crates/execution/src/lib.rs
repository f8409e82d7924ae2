pub mod fanout;
pub mod ingestor;
pub mod report;
pub mod sizer;

pub use fanout::FanoutExecutor;
pub use ingestor::{IngestError, SignalIngestor};
pub use report::FanoutReport;
pub use sizer::{PositionSizer, SizingError};
