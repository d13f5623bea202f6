pub mod calendar;
pub mod engine;
pub mod holds;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod retry;
pub mod wal;
pub mod wire;
