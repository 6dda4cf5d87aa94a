//! 公共类型（对外暴露，序列化层直接使用）
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DetectorFault;

/// 信号权重的允许范围（负值表示开脱性证据）
pub const WEIGHT_MIN: i32 = -50;
pub const WEIGHT_MAX: i32 = 50;

/// 威胁类别（按严重程度有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Safe,
    Suspicious,
    Threat,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::Safe => "safe",
            ThreatCategory::Suspicious => "suspicious",
            ThreatCategory::Threat => "threat",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 魔数签名标签（由文件头字节判定，与扩展名无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureTag {
    Pe,
    Elf,
    #[serde(rename = "macho")]
    MachO,
    Script,
    Archive,
    Pdf,
    Ole,
    Image,
    Unknown,
}

impl SignatureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureTag::Pe => "pe",
            SignatureTag::Elf => "elf",
            SignatureTag::MachO => "macho",
            SignatureTag::Script => "script",
            SignatureTag::Archive => "archive",
            SignatureTag::Pdf => "pdf",
            SignatureTag::Ole => "ole",
            SignatureTag::Image => "image",
            SignatureTag::Unknown => "unknown",
        }
    }

    /// 原生可执行格式
    pub fn is_native_executable(&self) -> bool {
        matches!(self, SignatureTag::Pe | SignatureTag::Elf | SignatureTag::MachO)
    }
}

impl fmt::Display for SignatureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个检测器的发现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub detector: String,
    pub weight: i32,
    pub confidence: f64,
    pub category_hint: ThreatCategory,
    pub evidence: String,
}

impl Signal {
    pub fn new(
        detector: impl Into<String>,
        weight: i32,
        confidence: f64,
        category_hint: ThreatCategory,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            detector: detector.into(),
            weight,
            confidence,
            category_hint,
            evidence: evidence.into(),
        }
    }

    /// 校验权重与置信度范围；越界视为检测器违约
    pub(crate) fn validate(&self) -> Result<(), DetectorFault> {
        if !(WEIGHT_MIN..=WEIGHT_MAX).contains(&self.weight) {
            return Err(DetectorFault::InvalidSignal {
                reason: format!("weight {} outside {}..={}", self.weight, WEIGHT_MIN, WEIGHT_MAX),
            });
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(DetectorFault::InvalidSignal {
                reason: format!("confidence {} outside 0.0..=1.0", self.confidence),
            });
        }
        Ok(())
    }
}

/// 诊断种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Fault,
    TimedOut,
}

/// 检测器故障或超时的记录（不影响扫描成败）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub detector: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// 扫描结果（对应输出 JSON 的单个对象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub threat_score: u8,
    pub threat_category: ThreatCategory,
    pub file_size: u64,
    pub file_extension: String,
    pub signature_tag: SignatureTag,
    /// 按检测器注册顺序排列
    pub signals: Vec<Signal>,
    pub analysis_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// 批量输出项（对应 JSON 数组中的单个元素）：成功带 result，失败带 error/kind
#[derive(Debug, Clone, Serialize)]
pub struct OutputItem<'a> {
    pub path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a ScanResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}
