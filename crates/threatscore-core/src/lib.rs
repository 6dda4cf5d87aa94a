//! 静态文件威胁评分引擎
//!
//! 设计要点：
//! - 数据单向流动：路径 → `FileFeatures` → `Signal` 序列 → `ScanResult`。
//! - 只做有界读取（元数据取大小，文件头最多读 `header_cap_bytes`），从不执行文件内容。
//! - 检测器是特征快照的纯函数；单个检测器的 panic、越界信号或超时只记为诊断，不影响其他检测器。
//! - 分数是信号序列与策略表的确定性纯函数；类别只由分数决定。
//! - 权重与阈值来自带版本号的 TOML 策略表，版本体现在 `analysis_version` 中。

mod aggregate;
mod detectors;
mod engine;
mod error;
mod features;
mod options;
mod probe;
mod registry;
mod rules;
mod scan;
mod types;

pub use aggregate::{effective_weight_milli, Aggregator, CONFIDENCE_SCALE, SCORE_MAX};
pub use detectors::{
    builtin_detectors, ConsistentType, Detector, EntropyAnomaly, ExtensionRisk, ScriptMarkers, SignatureMismatch,
    SizeAnomaly, CONSISTENT_TYPE, ENTROPY_ANOMALY, EXTENSION_RISK, SCRIPT_MARKERS, SIGNATURE_MISMATCH, SIZE_ANOMALY,
};
pub use engine::{CancelToken, ScanEngine, ENGINE_VERSION};
pub use error::{DetectorFault, PolicyError, ProbeError, RegistryError, ScanError};
pub use features::{normalize_extension, ExtensionClass, FileFeatures};
pub use options::{ScanConfig, ScanStats, DEFAULT_HEADER_CAP, MAX_HEADER_CAP};
pub use probe::{decode_signature, probe, MAGIC_TABLE_VERSION};
pub use registry::{DetectorRegistry, DetectorSet, Evaluation};
pub use rules::{
    EntropyPolicy, ExtensionClasses, ExtensionRiskPolicy, ScoringPolicy, ScriptMarkerPolicy, SizeAnomalyPolicy, Thresholds, WeightPolicy,
};
pub use scan::{collect_files, scan_and_write};
pub use types::{
    Diagnostic, DiagnosticKind, OutputItem, ScanResult, Signal, SignatureTag, ThreatCategory, WEIGHT_MAX, WEIGHT_MIN,
};
