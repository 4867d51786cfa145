pub mod bus;
pub mod commands;
pub mod connection;
pub mod guard;
pub mod metrics;
pub mod output;
pub mod register_cache;
pub mod registers;
pub mod snapshot;
pub mod telegram;
pub mod value;
