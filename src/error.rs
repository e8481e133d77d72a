use std::path::PathBuf;

use cpumask::MaskParseError;
use thiserror::Error;

/// 守护进程的错误类型
///
/// 启动阶段的错误是致命的；稳态运行期间的文件缺失、计数不一致等
/// 情况不会走到这里，而是按文档化的默认值降级处理。
#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid cpu mask: {0}")]
    Mask(#[from] MaskParseError),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BalanceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = core::result::Result<T, BalanceError>;
