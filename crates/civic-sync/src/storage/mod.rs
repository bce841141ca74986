//! 存储模块 - 引擎自身的持久化（同步状态、实体缓存）
//!
//! 所有数据落在 `data_dir/kv` 下的同一个 sled 数据库中，按 Tree 划分命名空间。

pub mod kv;

pub use kv::KvStore;
