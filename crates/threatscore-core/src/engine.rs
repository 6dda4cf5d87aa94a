//! 扫描引擎：Probe → 检测器求值 → 聚合
//!
//! 时间预算：
//! - 单检测器预算：检测器在独立的求值线程上按注册顺序执行，每个结果经
//!   `crossbeam-channel` 回传；调用方对每个检测器按截止时间等待。超时的检测器
//!   记为 `TimedOut` 诊断、不贡献信号，其后的检测器换一条新求值线程继续。
//! - 整次扫描预算：耗尽时返回 `ScanError::Timeout`，与“文件不可读”区分开。
//!   只设了整次预算时同样走求值线程，等待上限即扫描截止时间。
//! - 两种预算都为 0 时在调用线程内直接求值。
//!
//! 引擎不持有任何跨扫描的可变评分状态；注册表在扫描期间只读（快照）。
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, RecvTimeoutError};
use tracing::{debug, error};

use crate::aggregate::Aggregator;
use crate::detectors::{builtin_detectors, Detector};
use crate::error::{DetectorFault, PolicyError, ScanError};
use crate::features::FileFeatures;
use crate::options::ScanConfig;
use crate::probe::{probe, MAGIC_TABLE_VERSION};
use crate::registry::{evaluate_inline, run_isolated, DetectorRegistry, Evaluation};
use crate::rules::ScoringPolicy;
use crate::types::{ScanResult, Signal};

/// 引擎版本（随 crate 版本）
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 协作式取消标记（可克隆，跨线程共享）
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// 扫描引擎实例（自带注册表与策略表，可被多个线程同时使用）
pub struct ScanEngine {
    registry: DetectorRegistry,
    policy: ScoringPolicy,
    aggregator: Aggregator,
    analysis_version: String,
}

impl ScanEngine {
    /// 使用全部内置检测器
    pub fn new(policy: ScoringPolicy) -> Result<Self, PolicyError> {
        let registry = DetectorRegistry::new();
        for d in builtin_detectors(&policy)? {
            registry.register(d).map_err(|e| PolicyError::Invalid(e.to_string()))?;
        }
        Ok(Self::with_registry(policy, registry))
    }

    /// 使用调用方准备好的注册表
    pub fn with_registry(policy: ScoringPolicy, registry: DetectorRegistry) -> Self {
        let analysis_version = format!("{ENGINE_VERSION}+policy.{}.magic.{MAGIC_TABLE_VERSION}", policy.version);
        let aggregator = Aggregator::new(&policy.thresholds);
        Self { registry, policy, aggregator, analysis_version }
    }

    /// 注册表（可在扫描之间或并发地做快照替换）
    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// 形如 `0.1.0+policy.2.magic.1`，标识是哪张表给出的分数
    pub fn analysis_version(&self) -> &str {
        &self.analysis_version
    }

    /// 扫描单个文件
    pub fn scan(&self, path: &Path, config: &ScanConfig) -> Result<ScanResult, ScanError> {
        self.scan_with_cancel(path, config, &CancelToken::new())
    }

    /// 扫描单个文件（可取消）
    pub fn scan_with_cancel(&self, path: &Path, config: &ScanConfig, cancel: &CancelToken) -> Result<ScanResult, ScanError> {
        let started = Instant::now();
        let deadline = config.scan_budget().map(|b| started + b);
        check_cancel(cancel)?;

        let features = probe(path, config.effective_header_cap())?;
        check_budget(deadline, config)?;

        let result = self.assess_until(Arc::new(features), config, cancel, deadline)?;
        debug!(
            path = %path.display(),
            score = result.threat_score,
            category = %result.threat_category,
            elapsed_us = started.elapsed().as_micros() as u64,
            "scan finished"
        );
        Ok(result)
    }

    /// 对已探测的特征快照评分（不访问文件系统）
    pub fn assess(&self, features: FileFeatures, config: &ScanConfig) -> Result<ScanResult, ScanError> {
        let deadline = config.scan_budget().map(|b| Instant::now() + b);
        self.assess_until(Arc::new(features), config, &CancelToken::new(), deadline)
    }

    fn assess_until(
        &self,
        features: Arc<FileFeatures>,
        config: &ScanConfig,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<ScanResult, ScanError> {
        check_cancel(cancel)?;
        let detectors = self.registry.snapshot().select(config);

        // 两种预算都关闭时才在调用线程内直接求值
        let timeout = config.detector_timeout();
        let eval = if timeout.is_none() && deadline.is_none() {
            evaluate_inline(&detectors, &features)
        } else {
            evaluate_bounded(&detectors, &features, timeout, deadline, config, cancel)?
        };
        check_cancel(cancel)?;

        let (threat_score, threat_category) = self.aggregator.aggregate(&eval.signals);
        Ok(ScanResult {
            threat_score,
            threat_category,
            file_size: features.size(),
            file_extension: features.extension().to_string(),
            signature_tag: features.signature(),
            signals: eval.signals,
            analysis_version: self.analysis_version.clone(),
            diagnostics: eval.diagnostics,
        })
    }
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("registry", &self.registry)
            .field("analysis_version", &self.analysis_version)
            .finish()
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), ScanError> {
    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled);
    }
    Ok(())
}

fn check_budget(deadline: Option<Instant>, config: &ScanConfig) -> Result<(), ScanError> {
    match deadline {
        Some(d) if Instant::now() > d => Err(ScanError::Timeout { budget_ms: config.scan_timeout_ms }),
        _ => Ok(()),
    }
}

type Outcome = (usize, Result<Option<Signal>, DetectorFault>);

/// 带预算的求值（见模块文档）
fn evaluate_bounded(
    detectors: &[Arc<dyn Detector>],
    features: &Arc<FileFeatures>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    config: &ScanConfig,
    cancel: &CancelToken,
) -> Result<Evaluation, ScanError> {
    let mut eval = Evaluation::default();
    let mut next = 0usize;

    while next < detectors.len() {
        let rx = spawn_worker(&detectors[next..], next, Arc::clone(features))?;

        while next < detectors.len() {
            check_cancel(cancel)?;
            let per_detector = timeout.map(|t| Instant::now() + t);
            // (截止时间, 是否由整次扫描预算决定)
            let limit = match (deadline, per_detector) {
                (Some(d), Some(p)) if d < p => Some((d, true)),
                (_, Some(p)) => Some((p, false)),
                (Some(d), None) => Some((d, true)),
                (None, None) => None,
            };
            let scan_limited = limit.is_some_and(|(_, by_scan)| by_scan);
            let received = match limit {
                Some((until, _)) => rx.recv_deadline(until),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok((idx, outcome)) => {
                    eval.record(detectors[idx].id(), outcome);
                    next = idx + 1;
                }
                Err(RecvTimeoutError::Timeout) if scan_limited => {
                    return Err(ScanError::Timeout { budget_ms: config.scan_timeout_ms });
                }
                Err(RecvTimeoutError::Timeout) => {
                    eval.record_timeout(detectors[next].id(), config.per_detector_timeout_ms);
                    next += 1;
                    // 放弃被卡住的线程，其后的检测器在新线程上继续
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // run_isolated 已捕获 panic，走到这里说明求值线程异常退出
                    let fault = DetectorFault::Panicked { message: "evaluation worker exited unexpectedly".into() };
                    eval.record(detectors[next].id(), Err(fault));
                    next += 1;
                    break;
                }
            }
        }
    }

    Ok(eval)
}

/// 启动求值线程，依次执行 `detectors` 并回传 (全局下标, 结果)
fn spawn_worker(
    detectors: &[Arc<dyn Detector>],
    base: usize,
    features: Arc<FileFeatures>,
) -> Result<channel::Receiver<Outcome>, ScanError> {
    let (tx, rx) = channel::bounded::<Outcome>(detectors.len());
    let detectors: Vec<Arc<dyn Detector>> = detectors.to_vec();

    std::thread::Builder::new()
        .name("detector-eval".into())
        .spawn(move || {
            for (i, d) in detectors.iter().enumerate() {
                let outcome = run_isolated(d.as_ref(), &features);
                // 接收端已放弃（超时/取消）时直接退出
                if tx.send((base + i, outcome)).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| {
            error!(error = %e, "failed to spawn detector evaluation thread");
            ScanError::Internal { message: format!("spawn evaluation thread: {e}") }
        })?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiagnosticKind, ThreatCategory};

    struct Sleepy(&'static str, Duration);

    impl Detector for Sleepy {
        fn id(&self) -> &str {
            self.0
        }
        fn evaluate(&self, _features: &FileFeatures) -> Option<Signal> {
            std::thread::sleep(self.1);
            Some(Signal::new(self.0, 10, 1.0, ThreatCategory::Suspicious, "slept"))
        }
    }

    fn engine_with(detectors: Vec<Arc<dyn Detector>>) -> ScanEngine {
        let registry = DetectorRegistry::with_detectors(detectors).unwrap();
        ScanEngine::with_registry(ScoringPolicy::builtin(), registry)
    }

    fn features() -> FileFeatures {
        FileFeatures::from_parts("x.bin", 4, b"data".to_vec())
    }

    #[test]
    fn analysis_version_tracks_tables() {
        let engine = ScanEngine::new(ScoringPolicy::builtin()).unwrap();
        assert_eq!(engine.analysis_version(), format!("{ENGINE_VERSION}+policy.2.magic.1"));
    }

    #[test]
    fn slow_detector_times_out_without_blocking_others() {
        let engine = engine_with(vec![
            Arc::new(Sleepy("fast_a", Duration::ZERO)) as Arc<dyn Detector>,
            Arc::new(Sleepy("stuck", Duration::from_secs(5))),
            Arc::new(Sleepy("fast_b", Duration::ZERO)),
        ]);
        let cfg = ScanConfig { per_detector_timeout_ms: 50, scan_timeout_ms: 0, ..Default::default() };
        let started = Instant::now();
        let result = engine.assess(features(), &cfg).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let ids: Vec<&str> = result.signals.iter().map(|s| s.detector.as_str()).collect();
        assert_eq!(ids, ["fast_a", "fast_b"]);
        assert_eq!(result.threat_score, 20);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].detector, "stuck");
        assert_eq!(result.diagnostics[0].kind, DiagnosticKind::TimedOut);
    }

    #[test]
    fn scan_budget_overrun_is_a_timeout_error() {
        let engine = engine_with(vec![Arc::new(Sleepy("slow", Duration::from_millis(500))) as Arc<dyn Detector>]);
        let cfg = ScanConfig { per_detector_timeout_ms: 2000, scan_timeout_ms: 50, ..Default::default() };
        let err = engine.assess(features(), &cfg).unwrap_err();
        assert!(matches!(err, ScanError::Timeout { budget_ms: 50 }));
    }

    #[test]
    fn scan_budget_bounds_hung_detector_without_per_detector_budget() {
        let engine = engine_with(vec![Arc::new(Sleepy("hung", Duration::from_secs(3))) as Arc<dyn Detector>]);
        let cfg = ScanConfig { per_detector_timeout_ms: 0, scan_timeout_ms: 100, ..Default::default() };
        let started = Instant::now();
        let err = engine.assess(features(), &cfg).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, ScanError::Timeout { budget_ms: 100 }));
    }

    #[test]
    fn no_budgets_evaluates_inline() {
        let engine = engine_with(vec![Arc::new(Sleepy("slow", Duration::from_millis(30))) as Arc<dyn Detector>]);
        let cfg = ScanConfig { per_detector_timeout_ms: 0, scan_timeout_ms: 0, ..Default::default() };
        let result = engine.assess(features(), &cfg).unwrap();
        assert_eq!(result.threat_score, 10);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn inline_mode_matches_threaded_mode() {
        let engine = ScanEngine::new(ScoringPolicy::builtin()).unwrap();
        let f = FileFeatures::from_parts("payload.exe", 500, b"not a pe".to_vec());
        let inline = engine
            .assess(f.clone(), &ScanConfig { per_detector_timeout_ms: 0, scan_timeout_ms: 0, ..Default::default() })
            .unwrap();
        let threaded = engine.assess(f, &ScanConfig::default()).unwrap();
        assert_eq!(inline, threaded);
    }

    #[test]
    fn cancelled_token_stops_scan() {
        let engine = ScanEngine::new(ScoringPolicy::builtin()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine
            .scan_with_cancel(Path::new("/does/not/matter"), &ScanConfig::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, ScanError::Cancelled));
    }
}
