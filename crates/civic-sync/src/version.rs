//! 引擎版本与构建元信息
//!
//! - **Engine Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中由 vergen 生成

/// 引擎 semver，来自 Cargo.toml
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 用于日志打印的版本摘要
pub fn version_summary() -> String {
    format!("civic-sync {} ({}, built {})", ENGINE_VERSION, GIT_SHA, BUILD_TIME)
}
