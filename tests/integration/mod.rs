//! 集成测试模块
//!
//! 测试各组件与真实持久层之间的集成

#[cfg(feature = "postgres")]
#[allow(unused_imports)]
mod postgres_test;
