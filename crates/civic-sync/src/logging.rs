//! 日志初始化
//!
//! 宿主应用已安装全局 subscriber 时不覆盖，重复调用无副作用。

use tracing::Level;

/// 安装 fmt subscriber；debug_mode 下输出 DEBUG 级别
///
/// 返回本次是否成功安装。
pub fn init_logging(debug_mode: bool) -> bool {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(debug_mode)
        .try_init()
        .is_ok()
}
