//! 错误类型（探测 / 检测器 / 扫描 / 策略表）
use std::path::PathBuf;
use thiserror::Error;

/// 文件探测失败
#[derive(Debug, Error)]
pub enum ProbeError {
    /// 路径不存在、不是常规文件，或符号链接超过一层
    #[error("not found or not a regular file: {path}")]
    NotFound { path: PathBuf },

    /// 权限不足或有界读取期间发生 I/O 错误
    #[error("unreadable file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 单个检测器的故障（在注册表边界被隔离，不会升级为扫描失败）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectorFault {
    #[error("detector panicked: {message}")]
    Panicked { message: String },

    /// 检测器返回了越界的权重或置信度
    #[error("detector returned an invalid signal: {reason}")]
    InvalidSignal { reason: String },
}

/// 扫描失败
#[derive(Debug, Error)]
pub enum ScanError {
    /// 输入文件缺失或不可读（终态，不重试）
    #[error(transparent)]
    Input(#[from] ProbeError),

    /// 整体扫描预算耗尽
    #[error("scan exceeded its {budget_ms} ms budget")]
    Timeout { budget_ms: u64 },

    #[error("scan was cancelled")]
    Cancelled,

    /// 引擎内部故障
    #[error("internal engine fault: {message}")]
    Internal { message: String },
}

impl ScanError {
    /// 供序列化层使用的稳定错误种类
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::Input(_) => "input",
            ScanError::Timeout { .. } => "timeout",
            ScanError::Cancelled => "cancelled",
            ScanError::Internal { .. } => "internal",
        }
    }
}

/// 评分策略表加载或校验失败
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("cannot read policy table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse policy table: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid policy table: {0}")]
    Invalid(String),
}

/// 注册表变更失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("detector '{0}' is already registered")]
    DuplicateDetector(String),
}
