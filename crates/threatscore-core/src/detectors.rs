//! 检测器：能力契约与内置实现
//!
//! 每个检测器都是 `FileFeatures` 的纯函数：不做 I/O、不保存跨扫描状态、
//! 不依赖其他检测器的输出。规则不适用时返回 `None`，而不是零权重信号。
use std::collections::BTreeSet;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};

use crate::error::PolicyError;
use crate::features::{ExtensionClass, FileFeatures};
use crate::rules::{
    EntropyPolicy, ExtensionClasses, ExtensionRiskPolicy, ScoringPolicy, ScriptMarkerPolicy, SizeAnomalyPolicy,
    WeightPolicy,
};
use crate::types::{Signal, SignatureTag, ThreatCategory};

pub const EXTENSION_RISK: &str = "extension_risk";
pub const SIZE_ANOMALY: &str = "size_anomaly";
pub const SIGNATURE_MISMATCH: &str = "signature_mismatch";
pub const ENTROPY_ANOMALY: &str = "entropy_anomaly";
pub const SCRIPT_MARKERS: &str = "script_markers";
pub const CONSISTENT_TYPE: &str = "consistent_type";

/// 检测器能力契约
pub trait Detector: Send + Sync {
    /// 稳定标识，出现在信号与诊断中，也用于启用/排除
    fn id(&self) -> &str;

    /// 对单个特征快照求值
    fn evaluate(&self, features: &FileFeatures) -> Option<Signal>;
}

/// 按固定顺序构建全部内置检测器
pub fn builtin_detectors(policy: &ScoringPolicy) -> Result<Vec<Arc<dyn Detector>>, PolicyError> {
    let detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(ExtensionRisk::new(&policy.extension_risk)) as Arc<dyn Detector>,
        Arc::new(SizeAnomaly::new(&policy.size_anomaly, &policy.extension_classes)),
        Arc::new(SignatureMismatch::new(&policy.signature_mismatch, &policy.extension_classes)),
        Arc::new(EntropyAnomaly::new(&policy.entropy_anomaly)),
        Arc::new(ScriptMarkers::new(&policy.script_markers)?),
        Arc::new(ConsistentType::new(&policy.consistent_type, &policy.extension_classes)),
    ];
    Ok(detectors)
}

/// 危险扩展名（可执行/脚本类）
pub struct ExtensionRisk {
    policy: ExtensionRiskPolicy,
}

impl ExtensionRisk {
    pub fn new(policy: &ExtensionRiskPolicy) -> Self {
        Self { policy: policy.clone() }
    }
}

impl Detector for ExtensionRisk {
    fn id(&self) -> &str {
        EXTENSION_RISK
    }

    fn evaluate(&self, features: &FileFeatures) -> Option<Signal> {
        let ext = features.extension();
        if ext.is_empty() || !self.policy.extensions.iter().any(|e| e == ext) {
            return None;
        }
        Some(Signal::new(
            EXTENSION_RISK,
            self.policy.weight,
            self.policy.confidence,
            ThreatCategory::Suspicious,
            format!("extension .{ext} belongs to an executable or script class"),
        ))
    }
}

/// 大小异常：超大文件（轻微）或极小的“可执行文件”（典型投放器/桩程序）
pub struct SizeAnomaly {
    policy: SizeAnomalyPolicy,
    classes: ExtensionClasses,
}

impl SizeAnomaly {
    pub fn new(policy: &SizeAnomalyPolicy, classes: &ExtensionClasses) -> Self {
        Self { policy: policy.clone(), classes: classes.clone() }
    }
}

impl Detector for SizeAnomaly {
    fn id(&self) -> &str {
        SIZE_ANOMALY
    }

    fn evaluate(&self, features: &FileFeatures) -> Option<Signal> {
        let p = &self.policy;
        let size = features.size();
        if self.classes.classify(features.extension()) == ExtensionClass::Executable && size < p.tiny_threshold {
            return Some(Signal::new(
                SIZE_ANOMALY,
                p.tiny_weight,
                p.tiny_confidence,
                ThreatCategory::Threat,
                format!(
                    "executable .{} is only {size} bytes (below {})",
                    features.extension(),
                    p.tiny_threshold
                ),
            ));
        }
        if size > p.large_threshold {
            return Some(Signal::new(
                SIZE_ANOMALY,
                p.large_weight,
                p.large_confidence,
                ThreatCategory::Suspicious,
                format!("file is {size} bytes (above {})", p.large_threshold),
            ));
        }
        None
    }
}

/// 扩展名声明的类别与魔数签名不一致（伪装文件），两个方向都检查：
/// - 可执行类扩展名却没有 PE 头；
/// - 非可执行类扩展名下藏着原生可执行文件（无扩展名除外，Linux 程序通常如此）；
/// - 文档/图片扩展名下是脚本。
pub struct SignatureMismatch {
    policy: WeightPolicy,
    classes: ExtensionClasses,
}

impl SignatureMismatch {
    pub fn new(policy: &WeightPolicy, classes: &ExtensionClasses) -> Self {
        Self { policy: policy.clone(), classes: classes.clone() }
    }
}

impl Detector for SignatureMismatch {
    fn id(&self) -> &str {
        SIGNATURE_MISMATCH
    }

    fn evaluate(&self, features: &FileFeatures) -> Option<Signal> {
        let ext = features.extension();
        let actual = features.signature();
        let evidence = match self.classes.classify(ext) {
            ExtensionClass::Executable if actual != SignatureTag::Pe => {
                format!("extension .{ext} implies a PE executable but signature is {actual}")
            }
            ExtensionClass::Executable | ExtensionClass::Native => return None,
            ExtensionClass::Script if actual.is_native_executable() => {
                format!("extension .{ext} implies a script but signature is {actual} executable")
            }
            _ if !ext.is_empty() && actual.is_native_executable() => {
                format!("extension .{ext} implies a non-executable file but signature is {actual} executable")
            }
            ExtensionClass::Document | ExtensionClass::Image if actual == SignatureTag::Script => {
                format!("extension .{ext} implies a data file but content starts as a script")
            }
            _ => return None,
        };
        Some(Signal::new(
            SIGNATURE_MISMATCH,
            self.policy.weight,
            self.policy.confidence,
            ThreatCategory::Suspicious,
            evidence,
        ))
    }
}

/// 文件头熵过高（加壳/加密载荷）；已压缩的容器格式不评估
pub struct EntropyAnomaly {
    policy: EntropyPolicy,
}

impl EntropyAnomaly {
    pub fn new(policy: &EntropyPolicy) -> Self {
        Self { policy: policy.clone() }
    }
}

impl Detector for EntropyAnomaly {
    fn id(&self) -> &str {
        ENTROPY_ANOMALY
    }

    fn evaluate(&self, features: &FileFeatures) -> Option<Signal> {
        let sample = features.header().len();
        if sample < self.policy.min_sample {
            return None;
        }
        if matches!(features.signature(), SignatureTag::Archive | SignatureTag::Image | SignatureTag::Pdf) {
            return None;
        }
        let entropy = features.header_entropy();
        if entropy < self.policy.threshold {
            return None;
        }
        Some(Signal::new(
            ENTROPY_ANOMALY,
            self.policy.weight,
            self.policy.confidence,
            ThreatCategory::Suspicious,
            format!("header entropy {entropy:.3} bits/byte over {sample} bytes"),
        ))
    }
}

/// 文本类文件头中的脚本滥用标记（Aho-Corasick，ASCII 大小写不敏感）
pub struct ScriptMarkers {
    policy: ScriptMarkerPolicy,
    ac: AhoCorasick,
}

impl ScriptMarkers {
    pub fn new(policy: &ScriptMarkerPolicy) -> Result<Self, PolicyError> {
        let ac = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(&policy.markers)
            .map_err(|e| PolicyError::Invalid(format!("script_markers: {e}")))?;
        Ok(Self { policy: policy.clone(), ac })
    }
}

impl Detector for ScriptMarkers {
    fn id(&self) -> &str {
        SCRIPT_MARKERS
    }

    fn evaluate(&self, features: &FileFeatures) -> Option<Signal> {
        if features.header().is_empty() || features.is_probably_binary() {
            return None;
        }
        // 按表顺序输出，保证证据文本稳定
        let hits: BTreeSet<usize> = self.ac.find_iter(features.header()).map(|m| m.pattern().as_usize()).collect();
        if hits.is_empty() {
            return None;
        }
        let names: Vec<&str> = hits.iter().filter_map(|&i| self.policy.markers.get(i).map(String::as_str)).collect();
        Some(Signal::new(
            SCRIPT_MARKERS,
            self.policy.weight,
            self.policy.confidence,
            ThreatCategory::Suspicious,
            format!("script abuse markers in header: {}", names.join(", ")),
        ))
    }
}

/// 开脱性证据：可识别的非可执行签名与扩展名一致
pub struct ConsistentType {
    policy: WeightPolicy,
    classes: ExtensionClasses,
}

impl ConsistentType {
    pub fn new(policy: &WeightPolicy, classes: &ExtensionClasses) -> Self {
        Self { policy: policy.clone(), classes: classes.clone() }
    }
}

impl Detector for ConsistentType {
    fn id(&self) -> &str {
        CONSISTENT_TYPE
    }

    fn evaluate(&self, features: &FileFeatures) -> Option<Signal> {
        let ext = features.extension();
        let signature = features.signature();
        let class = self.classes.classify(ext);
        let consistent = match signature {
            SignatureTag::Pdf => ext == "pdf",
            SignatureTag::Image => class == ExtensionClass::Image,
            SignatureTag::Archive => class == ExtensionClass::Archive,
            SignatureTag::Ole => matches!(ext, "doc" | "xls" | "ppt" | "msg"),
            _ => false,
        };
        if !consistent {
            return None;
        }
        Some(Signal::new(
            CONSISTENT_TYPE,
            self.policy.weight,
            self.policy.confidence,
            ThreatCategory::Safe,
            format!("extension .{ext} agrees with {signature} signature"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScoringPolicy {
        ScoringPolicy::builtin()
    }

    fn features(name: &str, size: u64, header: &[u8]) -> FileFeatures {
        FileFeatures::from_parts(name, size, header.to_vec())
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect()
    }

    #[test]
    fn builtin_order_is_stable() {
        let ids: Vec<String> = builtin_detectors(&policy()).unwrap().iter().map(|d| d.id().to_string()).collect();
        assert_eq!(
            ids,
            [EXTENSION_RISK, SIZE_ANOMALY, SIGNATURE_MISMATCH, ENTROPY_ANOMALY, SCRIPT_MARKERS, CONSISTENT_TYPE]
        );
    }

    #[test]
    fn extension_risk_fires_on_dangerous_extension_only() {
        let d = ExtensionRisk::new(&policy().extension_risk);
        let s = d.evaluate(&features("run.PS1", 100, b"Write-Host hi")).unwrap();
        assert_eq!(s.weight, 30);
        assert_eq!(s.category_hint, ThreatCategory::Suspicious);
        assert!(d.evaluate(&features("notes.txt", 100, b"hi")).is_none());
        assert!(d.evaluate(&features("README", 100, b"hi")).is_none());
    }

    #[test]
    fn size_anomaly_tiny_executable_and_large_file() {
        let p = policy();
        let d = SizeAnomaly::new(&p.size_anomaly, &p.extension_classes);
        let tiny = d.evaluate(&features("stub.dll", 999, b"MZ")).unwrap();
        assert_eq!((tiny.weight, tiny.category_hint), (40, ThreatCategory::Threat));
        assert!(d.evaluate(&features("stub.dll", 1000, b"MZ")).is_none());
        assert!(d.evaluate(&features("tiny.txt", 10, b"hi")).is_none());
        // com/pif 与危险扩展名表一致，同样按可执行文件对待
        assert_eq!(d.evaluate(&features("menu.com", 200, b"\xB4\x09")).unwrap().weight, 40);
        assert_eq!(d.evaluate(&features("setup.pif", 200, b"MZ")).unwrap().weight, 40);

        let large = d.evaluate(&features("video.mp4", 10_000_001, b"")).unwrap();
        assert_eq!(large.weight, 10);
        assert!(d.evaluate(&features("video.mp4", 10_000_000, b"")).is_none());
    }

    fn mismatch() -> SignatureMismatch {
        let p = policy();
        SignatureMismatch::new(&p.signature_mismatch, &p.extension_classes)
    }

    #[test]
    fn signature_mismatch_both_directions() {
        let d = mismatch();
        assert_eq!(d.evaluate(&features("payload.exe", 500, b"hello")).unwrap().weight, 35);
        assert!(d.evaluate(&features("invoice.pdf", 5000, b"MZ\x90\x00")).is_some());
        assert!(d.evaluate(&features("photo.jpg", 5000, b"#!/bin/sh\n")).is_some());
        assert!(d.evaluate(&features("app.exe", 5000, b"MZ\x90\x00")).is_none());
        // Linux 可执行文件通常无扩展名
        assert!(d.evaluate(&features("ls", 5000, b"\x7FELF\x02")).is_none());
        assert!(d.evaluate(&features("notes.txt", 5000, b"plain")).is_none());
    }

    #[test]
    fn native_executable_under_any_other_extension_is_a_mismatch() {
        let d = mismatch();
        for name in ["update.js", "run.bat", "song.mp3", "data.dat", "cache.tmp"] {
            let s = d.evaluate(&features(name, 4000, b"MZ\x90\x00")).unwrap_or_else(|| panic!("{name}"));
            assert_eq!(s.weight, 35, "{name}");
        }
        let elf = d.evaluate(&features("install.sh", 4000, b"\x7FELF\x02\x01")).unwrap();
        assert!(elf.evidence.contains("implies a script"));
        assert!(d.evaluate(&features("song.mp3", 4000, b"ID3\x04")).is_none());
    }

    #[test]
    fn native_library_extensions_accept_any_native_format() {
        let d = mismatch();
        assert!(d.evaluate(&features("libssl.so", 4000, b"\x7FELF\x02\x01")).is_none());
        assert!(d.evaluate(&features("libfoo.dylib", 4000, &[0xCF, 0xFA, 0xED, 0xFE, 7, 0, 0, 1])).is_none());
        assert!(d.evaluate(&features("module.so", 4000, b"MZ\x90\x00")).is_none());
    }

    #[test]
    fn entropy_anomaly_needs_sample_and_skips_containers() {
        let d = EntropyAnomaly::new(&policy().entropy_anomaly);
        let noisy = pseudo_random(4096);
        let mut pe = b"MZ".to_vec();
        pe.extend_from_slice(&noisy);
        assert!(features("packed.exe", 9000, &pe).header_entropy() >= 7.2);
        assert!(d.evaluate(&features("packed.exe", 9000, &pe)).is_some());

        let mut zip = b"PK\x03\x04".to_vec();
        zip.extend_from_slice(&noisy);
        assert!(d.evaluate(&features("bundle.zip", 9000, &zip)).is_none());
        assert!(d.evaluate(&features("short.bin", 100, &noisy[..100])).is_none());
        assert!(d.evaluate(&features("flat.bin", 4096, &[0x41; 4096])).is_none());
    }

    #[test]
    fn script_markers_case_insensitive_and_text_only() {
        let d = ScriptMarkers::new(&policy().script_markers).unwrap();
        let s = d
            .evaluate(&features("a.bat", 200, b"@echo off\r\nPowerShell -Enc SQBFAFgA\r\n"))
            .unwrap();
        assert!(s.evidence.contains("powershell -enc"));
        assert!(d.evaluate(&features("a.bin", 200, b"\0powershell -enc")).is_none());
        assert!(d.evaluate(&features("notes.txt", 200, b"meeting notes")).is_none());
    }

    #[test]
    fn consistent_type_is_exonerating() {
        let p = policy();
        let d = ConsistentType::new(&p.consistent_type, &p.extension_classes);
        let s = d.evaluate(&features("report.pdf", 5000, b"%PDF-1.7")).unwrap();
        assert!(s.weight < 0);
        assert_eq!(s.category_hint, ThreatCategory::Safe);
        assert!(d.evaluate(&features("report.exe", 5000, b"%PDF-1.7")).is_none());
        assert!(d.evaluate(&features("app.exe", 5000, b"MZ")).is_none());
    }
}
