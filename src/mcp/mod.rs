pub mod dispatch;
pub mod handler;
pub mod schemas;
