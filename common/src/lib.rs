//! Support code shared by the host controller crates: register cells, time keeping and logging.

pub mod io;
pub mod logger;
pub mod timeout;
