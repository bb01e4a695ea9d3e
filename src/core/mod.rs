pub mod block;
pub mod config;
pub mod dispatch;
pub mod interpreter;
pub mod invoker;
pub mod lifecycle;
pub mod message;
pub mod store;
pub mod terminal;
