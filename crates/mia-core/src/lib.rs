//! # MIA Core
//!
//! 医学影像归档系统的核心模块，提供基础数据结构、错误定义、
//! 上传会话模型和通用工具。

pub mod error;
pub mod models;
pub mod upload;
pub mod utils;

pub use error::{MiaError, Result};
pub use models::*;
pub use upload::*;
