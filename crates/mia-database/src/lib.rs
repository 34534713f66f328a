//! # MIA数据库模块
//!
//! 层次化持久层：以单文件事务将提取的元数据upsert为
//! Study→Series→Image三级实体，唯一性冲突由存储层约束消解。

pub mod connection;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repository;

pub use connection::DatabasePool;
pub use memory::MemoryImageRepository;
pub use postgres::PgImageRepository;
pub use repository::ImageRepository;
