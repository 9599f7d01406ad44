//! Order-book maintenance: the local book and the per-instrument ingestor
//! state machine that keeps it in sync with the venue.

pub mod book;
pub mod ingestor;

pub use book::OrderBook;
pub use ingestor::{Ingestor, IngestorStats};
