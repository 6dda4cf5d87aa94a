//! 检测器注册表
//!
//! 注册表持有一个不可变的检测器集合快照（`Arc<DetectorSet>`）。
//! 注册/注销采用写时复制：构造新集合后整体替换，正在进行的扫描继续使用
//! 各自取到的旧快照，永远不会看到半更新的集合。
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::detectors::Detector;
use crate::error::{DetectorFault, RegistryError};
use crate::features::FileFeatures;
use crate::options::ScanConfig;
use crate::types::{Diagnostic, DiagnosticKind, Signal};

/// 单次求值的输出：按注册顺序排列的信号 + 诊断
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub signals: Vec<Signal>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Evaluation {
    /// 合并单个检测器的结果
    pub(crate) fn record(&mut self, detector_id: &str, outcome: Result<Option<Signal>, DetectorFault>) {
        match outcome {
            Ok(Some(signal)) => self.signals.push(signal),
            Ok(None) => {}
            Err(fault) => {
                warn!(detector = detector_id, %fault, "detector fault isolated");
                self.diagnostics.push(Diagnostic {
                    detector: detector_id.to_string(),
                    kind: DiagnosticKind::Fault,
                    message: fault.to_string(),
                });
            }
        }
    }

    pub(crate) fn record_timeout(&mut self, detector_id: &str, budget_ms: u64) {
        warn!(detector = detector_id, budget_ms, "detector timed out");
        self.diagnostics.push(Diagnostic {
            detector: detector_id.to_string(),
            kind: DiagnosticKind::TimedOut,
            message: format!("no result within {budget_ms} ms"),
        });
    }
}

/// 在隔离边界内执行单个检测器：panic 与越界信号都转为 `DetectorFault`
pub(crate) fn run_isolated(detector: &dyn Detector, features: &FileFeatures) -> Result<Option<Signal>, DetectorFault> {
    let outcome = catch_unwind(AssertUnwindSafe(|| detector.evaluate(features)))
        .map_err(|payload| DetectorFault::Panicked { message: panic_message(payload.as_ref()) })?;
    if let Some(signal) = &outcome {
        signal.validate()?;
    }
    Ok(outcome)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// 不可变的有序检测器集合
#[derive(Clone, Default)]
pub struct DetectorSet {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorSet {
    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// 注册顺序的 id 列表
    pub fn ids(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.id()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.detectors.iter().any(|d| d.id() == id)
    }

    /// 按扫描配置挑选启用的检测器（保持注册顺序）
    pub(crate) fn select(&self, config: &ScanConfig) -> Vec<Arc<dyn Detector>> {
        if let Some(enabled) = &config.enabled_detectors {
            for id in enabled.iter().filter(|id| !self.contains(id)) {
                warn!(detector = %id, "enabled detector is not registered");
            }
        }
        self.detectors.iter().filter(|d| config.is_enabled(d.id())).cloned().collect()
    }

    /// 在调用线程内按注册顺序依次求值全部检测器
    pub fn evaluate(&self, features: &FileFeatures) -> Evaluation {
        evaluate_inline(&self.detectors, features)
    }
}

impl std::fmt::Debug for DetectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorSet").field("detectors", &self.ids()).finish()
    }
}

pub(crate) fn evaluate_inline(detectors: &[Arc<dyn Detector>], features: &FileFeatures) -> Evaluation {
    let mut eval = Evaluation::default();
    for d in detectors {
        eval.record(d.id(), run_isolated(d.as_ref(), features));
    }
    eval
}

/// 检测器注册表（可跨线程共享）
#[derive(Default)]
pub struct DetectorRegistry {
    current: RwLock<Arc<DetectorSet>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定顺序批量注册
    pub fn with_detectors(detectors: Vec<Arc<dyn Detector>>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for d in detectors {
            registry.register(d)?;
        }
        Ok(registry)
    }

    /// 追加一个检测器；id 重复时拒绝
    pub fn register(&self, detector: Arc<dyn Detector>) -> Result<(), RegistryError> {
        let mut guard = self.current.write();
        if guard.contains(detector.id()) {
            return Err(RegistryError::DuplicateDetector(detector.id().to_string()));
        }
        let mut next = DetectorSet::clone(&guard);
        next.detectors.push(detector);
        *guard = Arc::new(next);
        Ok(())
    }

    /// 移除指定 id 的检测器；返回是否存在
    pub fn unregister(&self, id: &str) -> bool {
        let mut guard = self.current.write();
        if !guard.contains(id) {
            return false;
        }
        let mut next = DetectorSet::clone(&guard);
        next.detectors.retain(|d| d.id() != id);
        *guard = Arc::new(next);
        true
    }

    /// 取当前快照；扫描全程只使用这一份
    pub fn snapshot(&self) -> Arc<DetectorSet> {
        Arc::clone(&self.current.read())
    }

    /// 对当前快照求值
    pub fn evaluate(&self, features: &FileFeatures) -> Evaluation {
        self.snapshot().evaluate(features)
    }
}

impl std::fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRegistry").field("current", &*self.snapshot()).finish()
    }
}
