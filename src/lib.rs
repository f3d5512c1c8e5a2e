pub mod commit;
pub mod config;
pub mod consumer;
pub mod done;
pub mod expression;
pub mod file;
pub mod filter;
pub mod humanize;
pub mod idempotent;
pub mod lock;
pub mod observability;
pub mod poller;
pub mod relocate;
pub mod writer;
