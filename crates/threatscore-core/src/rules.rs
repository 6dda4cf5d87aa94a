//! 评分策略表加载（TOML）
//!
//! 所有权重、置信度与阈值都来自这张带版本号的表，而不是散落在检测器里的常量。
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PolicyError;
use crate::features::ExtensionClass;
use crate::types::{WEIGHT_MAX, WEIGHT_MIN};

/// 内置默认表
const DEFAULT_POLICY_TOML: &str = include_str!("../rules/default.toml");

/// 类别阈值
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    pub suspicious: u8,
    pub threat: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionRiskPolicy {
    pub weight: i32,
    pub confidence: f64,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeAnomalyPolicy {
    pub large_threshold: u64,
    pub large_weight: i32,
    pub large_confidence: f64,
    pub tiny_threshold: u64,
    pub tiny_weight: i32,
    pub tiny_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightPolicy {
    pub weight: i32,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntropyPolicy {
    pub weight: i32,
    pub confidence: f64,
    /// 比特/字节
    pub threshold: f64,
    /// 采样不足该字节数时不评估
    pub min_sample: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptMarkerPolicy {
    pub weight: i32,
    pub confidence: f64,
    pub markers: Vec<String>,
}

/// 扩展名 → 声明类别的归类表（小写、无前导点）
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionClasses {
    pub executable: Vec<String>,
    pub native: Vec<String>,
    pub script: Vec<String>,
    pub archive: Vec<String>,
    pub document: Vec<String>,
    pub image: Vec<String>,
    pub text: Vec<String>,
}

impl ExtensionClasses {
    /// 归类；空扩展名与未列出的扩展名都是 `Other`
    pub fn classify(&self, ext: &str) -> ExtensionClass {
        if ext.is_empty() {
            return ExtensionClass::Other;
        }
        self.tables()
            .into_iter()
            .find(|(_, table)| table.iter().any(|e| e == ext))
            .map_or(ExtensionClass::Other, |(class, _)| class)
    }

    fn tables(&self) -> [(ExtensionClass, &Vec<String>); 7] {
        [
            (ExtensionClass::Executable, &self.executable),
            (ExtensionClass::Native, &self.native),
            (ExtensionClass::Script, &self.script),
            (ExtensionClass::Archive, &self.archive),
            (ExtensionClass::Document, &self.document),
            (ExtensionClass::Image, &self.image),
            (ExtensionClass::Text, &self.text),
        ]
    }

    fn tables_mut(&mut self) -> [&mut Vec<String>; 7] {
        [
            &mut self.executable,
            &mut self.native,
            &mut self.script,
            &mut self.archive,
            &mut self.document,
            &mut self.image,
            &mut self.text,
        ]
    }

    /// 每个扩展名至多属于一个类别
    fn validate(&self) -> Result<(), PolicyError> {
        let mut seen: BTreeMap<&str, ExtensionClass> = BTreeMap::new();
        for (class, table) in self.tables() {
            for ext in table {
                if ext.is_empty() {
                    return Err(PolicyError::Invalid(format!("extension_classes: empty entry in {class:?}")));
                }
                if let Some(prev) = seen.insert(ext, class) {
                    return Err(PolicyError::Invalid(format!(
                        "extension_classes: .{ext} listed under both {prev:?} and {class:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// 顶层策略表
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringPolicy {
    pub version: u32,
    pub thresholds: Thresholds,
    pub extension_risk: ExtensionRiskPolicy,
    pub size_anomaly: SizeAnomalyPolicy,
    pub signature_mismatch: WeightPolicy,
    pub entropy_anomaly: EntropyPolicy,
    pub script_markers: ScriptMarkerPolicy,
    pub consistent_type: WeightPolicy,
    pub extension_classes: ExtensionClasses,
}

impl ScoringPolicy {
    /// 内置默认表（随库一起发布，单元测试保证其合法）
    pub fn builtin() -> Self {
        Self::from_toml_str(DEFAULT_POLICY_TOML).expect("embedded policy table is valid")
    }

    /// 解析并校验 TOML 文本
    pub fn from_toml_str(txt: &str) -> Result<Self, PolicyError> {
        let mut parsed: ScoringPolicy = toml::from_str(txt)?;
        // 扩展名统一为小写、无前导点，与 FileFeatures 保持一致
        for table in std::iter::once(&mut parsed.extension_risk.extensions).chain(parsed.extension_classes.tables_mut()) {
            for ext in table.iter_mut() {
                *ext = ext.trim_start_matches('.').to_ascii_lowercase();
            }
        }
        for marker in parsed.script_markers.markers.iter_mut() {
            *marker = marker.to_ascii_lowercase();
        }
        parsed.validate()?;
        Ok(parsed)
    }

    /// 从文件加载策略表
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let txt = std::fs::read_to_string(path)
            .map_err(|source| PolicyError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&txt)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let t = &self.thresholds;
        if !(0 < t.suspicious && t.suspicious < t.threat && t.threat <= 100) {
            return Err(PolicyError::Invalid(format!(
                "thresholds must satisfy 0 < suspicious < threat <= 100 (got {} / {})",
                t.suspicious, t.threat
            )));
        }

        let weights = [
            ("extension_risk", self.extension_risk.weight, self.extension_risk.confidence),
            ("size_anomaly.large", self.size_anomaly.large_weight, self.size_anomaly.large_confidence),
            ("size_anomaly.tiny", self.size_anomaly.tiny_weight, self.size_anomaly.tiny_confidence),
            ("signature_mismatch", self.signature_mismatch.weight, self.signature_mismatch.confidence),
            ("entropy_anomaly", self.entropy_anomaly.weight, self.entropy_anomaly.confidence),
            ("script_markers", self.script_markers.weight, self.script_markers.confidence),
            ("consistent_type", self.consistent_type.weight, self.consistent_type.confidence),
        ];
        for (name, weight, confidence) in weights {
            if !(WEIGHT_MIN..=WEIGHT_MAX).contains(&weight) {
                return Err(PolicyError::Invalid(format!(
                    "{name}: weight {weight} outside {WEIGHT_MIN}..={WEIGHT_MAX}"
                )));
            }
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                return Err(PolicyError::Invalid(format!(
                    "{name}: confidence {confidence} outside 0.0..=1.0"
                )));
            }
        }

        if self.size_anomaly.tiny_threshold >= self.size_anomaly.large_threshold {
            return Err(PolicyError::Invalid("size_anomaly: tiny_threshold must be below large_threshold".into()));
        }
        let e = self.entropy_anomaly.threshold;
        if !e.is_finite() || !(0.0..=8.0).contains(&e) {
            return Err(PolicyError::Invalid(format!("entropy_anomaly: threshold {e} outside 0.0..=8.0")));
        }
        if self.script_markers.markers.iter().any(|m| m.is_empty()) {
            return Err(PolicyError::Invalid("script_markers: empty marker".into()));
        }

        self.extension_classes.validate()?;
        // 可执行类同时决定 tiny 与签名不符两条规则，必须也在危险扩展名表中
        let risky = &self.extension_risk.extensions;
        if let Some(ext) = self.extension_classes.executable.iter().find(|e| !risky.contains(e)) {
            return Err(PolicyError::Invalid(format!(
                "extension_classes.executable: .{ext} is missing from extension_risk.extensions"
            )));
        }
        Ok(())
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}
