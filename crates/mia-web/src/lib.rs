//! # MIA Web
//!
//! 批量摄取流水线的HTTP入口：上传提交、进度轮询与结果获取。

pub mod handlers;
pub mod server;

pub use server::{AppState, WebServer};
