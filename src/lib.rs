pub mod config;
pub mod derive;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod series;
pub mod session;
pub mod source;
pub mod store;

pub use config::Config;
pub use error::{IngestError, Result};
pub use pipeline::{BatchReport, Pipeline};
pub use store::Store;
