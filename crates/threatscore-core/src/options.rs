//! 扫描选项与统计信息（模块）
use std::collections::BTreeSet;
use std::time::Duration;

/// 默认文件头采样上限（字节）
pub const DEFAULT_HEADER_CAP: usize = 4096;
/// 文件头采样的硬上限；配置值超过时截断到此值
pub const MAX_HEADER_CAP: usize = 1024 * 1024;

/// 单次扫描选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// 文件头最多读取的字节数
    pub header_cap_bytes: usize,
    /// 单个检测器的时间预算（毫秒）；0 表示不设单检测器预算（整次预算仍然生效）
    pub per_detector_timeout_ms: u64,
    /// 整次扫描的时间预算（毫秒）；0 表示不限制
    pub scan_timeout_ms: u64,
    /// 启用的检测器 id；None 表示全部已注册检测器
    pub enabled_detectors: Option<BTreeSet<String>>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            header_cap_bytes: DEFAULT_HEADER_CAP,
            per_detector_timeout_ms: 200,
            scan_timeout_ms: 1000,
            enabled_detectors: None,
        }
    }
}

impl ScanConfig {
    /// 实际生效的文件头上限
    pub fn effective_header_cap(&self) -> usize {
        self.header_cap_bytes.min(MAX_HEADER_CAP)
    }

    pub(crate) fn detector_timeout(&self) -> Option<Duration> {
        match self.per_detector_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(crate) fn scan_budget(&self) -> Option<Duration> {
        match self.scan_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(crate) fn is_enabled(&self, detector_id: &str) -> bool {
        match &self.enabled_detectors {
            Some(set) => set.contains(detector_id),
            None => true,
        }
    }
}

/// 批量扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub files_failed: usize,
    pub outputs_written: usize,
}
