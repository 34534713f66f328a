//! # MIA存储模块
//!
//! 负责原始影像载荷的落盘存储，按检查/序列/实例三级层次寻址。

pub mod storage;

pub use storage::*;
