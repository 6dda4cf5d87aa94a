//! 信号聚合：多路信号 → 0..=100 分数 + 类别
//!
//! 组合规则：
//! - 每个信号先按置信度折算：有效权重 = weight × confidence；
//! - 有效权重求和后才做一次 [0, 100] 截断（不是逐步截断）；
//! - 类别只由最终分数经单调阶梯函数得出，与任何单个信号的类别提示无关。
//!
//! 置信度按千分之一量化为整数后累加，整数加法满足交换律，
//! 因而分数与信号顺序无关，且跨平台逐位可复现。
use crate::rules::Thresholds;
use crate::types::{Signal, ThreatCategory};

/// 置信度量化精度（千分之一）
pub const CONFIDENCE_SCALE: i64 = 1000;

pub const SCORE_MAX: u8 = 100;

/// 单个信号的有效权重（以 1/CONFIDENCE_SCALE 分为单位）
pub fn effective_weight_milli(signal: &Signal) -> i64 {
    let confidence = if signal.confidence.is_finite() { signal.confidence.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = (confidence * CONFIDENCE_SCALE as f64).round() as i64;
    i64::from(signal.weight) * scaled
}

/// 聚合器（持有类别阈值）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregator {
    suspicious: u8,
    threat: u8,
}

impl Aggregator {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self { suspicious: thresholds.suspicious, threat: thresholds.threat }
    }

    /// 聚合信号序列；空序列得到 (0, Safe)
    pub fn aggregate(&self, signals: &[Signal]) -> (u8, ThreatCategory) {
        let score = self.score(signals);
        (score, self.category_for(score))
    }

    pub fn score(&self, signals: &[Signal]) -> u8 {
        let total: i64 = signals.iter().map(effective_weight_milli).sum();
        if total <= 0 {
            return 0;
        }
        // 四舍五入到整数分，再截断到上限
        let rounded = (total + CONFIDENCE_SCALE / 2) / CONFIDENCE_SCALE;
        rounded.min(i64::from(SCORE_MAX)) as u8
    }

    /// 单调阶梯：[0, suspicious) → Safe，[suspicious, threat) → Suspicious，[threat, 100] → Threat
    pub fn category_for(&self, score: u8) -> ThreatCategory {
        if score >= self.threat {
            ThreatCategory::Threat
        } else if score >= self.suspicious {
            ThreatCategory::Suspicious
        } else {
            ThreatCategory::Safe
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg() -> Aggregator {
        Aggregator::new(&Thresholds { suspicious: 30, threat: 70 })
    }

    fn sig(weight: i32, confidence: f64) -> Signal {
        Signal::new("t", weight, confidence, ThreatCategory::Suspicious, "")
    }

    #[test]
    fn empty_is_zero_safe() {
        assert_eq!(agg().aggregate(&[]), (0, ThreatCategory::Safe));
    }

    #[test]
    fn category_boundaries() {
        let a = agg();
        assert_eq!(a.category_for(0), ThreatCategory::Safe);
        assert_eq!(a.category_for(29), ThreatCategory::Safe);
        assert_eq!(a.category_for(30), ThreatCategory::Suspicious);
        assert_eq!(a.category_for(69), ThreatCategory::Suspicious);
        assert_eq!(a.category_for(70), ThreatCategory::Threat);
        assert_eq!(a.category_for(100), ThreatCategory::Threat);
    }

    #[test]
    fn clamps_only_at_the_end() {
        let a = agg();
        // 逐步截断会得到 100 - 50 = 50；末端截断得到 min(150 - 50, 100) = 100
        let signals = [sig(50, 1.0), sig(50, 1.0), sig(50, 1.0), sig(-50, 1.0)];
        assert_eq!(a.aggregate(&signals), (100, ThreatCategory::Threat));
        let many: Vec<Signal> = (0..64).map(|_| sig(50, 1.0)).collect();
        assert_eq!(a.score(&many), 100);
    }

    #[test]
    fn negative_floor_is_zero() {
        let a = agg();
        assert_eq!(a.aggregate(&[sig(10, 1.0), sig(-50, 1.0)]), (0, ThreatCategory::Safe));
    }

    #[test]
    fn confidence_dampens_weight() {
        let a = agg();
        assert_eq!(a.score(&[sig(40, 0.5)]), 20);
        assert_eq!(a.score(&[sig(15, 0.6)]), 9);
        assert_eq!(a.score(&[sig(1, 0.5)]), 1);
        assert_eq!(a.score(&[sig(1, 0.4)]), 0);
        assert_eq!(a.score(&[sig(50, 0.0)]), 0);
    }

    #[test]
    fn placeholder_scenario_saturates() {
        let signals = [sig(30, 1.0), sig(40, 1.0), sig(35, 1.0)];
        assert_eq!(agg().aggregate(&signals), (100, ThreatCategory::Threat));
    }

    #[test]
    fn order_independent() {
        let a = agg();
        let mut signals = vec![sig(13, 0.333), sig(-7, 0.9), sig(22, 0.71), sig(5, 0.125)];
        let forward = a.aggregate(&signals);
        signals.reverse();
        assert_eq!(a.aggregate(&signals), forward);
        signals.swap(0, 2);
        assert_eq!(a.aggregate(&signals), forward);
    }

    #[test]
    fn monotonic_in_added_positive_signal() {
        let a = agg();
        let base = vec![sig(20, 0.8), sig(-10, 1.0), sig(5, 0.3)];
        let before = a.score(&base);
        for weight in 0..=50 {
            for confidence in [0.0, 0.1, 0.5, 0.99, 1.0] {
                let mut more = base.clone();
                more.push(sig(weight, confidence));
                assert!(a.score(&more) >= before);
            }
        }
    }
}
