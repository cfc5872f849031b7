//! 时间零点 / 峰值对齐策略模块
//!
//! 从两通道合计信号中定位零延迟bin，用于把bin索引换算为相对时间：
//! `t_ns = (bin_index - zero_bin) × ns_per_bin`。
//!
//! ## 职责边界
//!
//! 本模块仅负责：**给定一条信号，按所选策略返回零点bin**。
//!
//! - ✅ 定义对齐策略（MaxRisingEdge, MaxValue）并实现定位逻辑
//! - ✅ 提供bin与纳秒换算
//! - ❌ 选择哪种采集使用哪种策略（由配置 `AnalysisConfig` 显式指定）
//!
//! ## 策略说明
//!
//! - **MaxRisingEdge**：累加的触发帧信号取一阶差分最大处（最陡上升沿），
//!   低计数时比可见峰位更稳定
//! - **MaxValue**：干净的单次衰减直接取最大值所在bin

use crate::error::{AnalysisError, AnalysisResult};
use serde::{Deserialize, Serialize};

/// 零点定位策略枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentPolicy {
    /// 一阶差分最大处（触发帧累加数据）
    #[default]
    MaxRisingEdge,

    /// 原始值最大处（单次干净衰减）
    MaxValue,
}

/// 零点定位器trait
pub trait ZeroBinLocator {
    /// 返回零点bin索引
    ///
    /// 并列时取第一个索引。
    fn locate(&self, signal: &[f64]) -> AnalysisResult<usize>;

    /// 获取策略描述（用于日志输出）
    fn policy_name(&self) -> &'static str;
}

impl ZeroBinLocator for AlignmentPolicy {
    fn locate(&self, signal: &[f64]) -> AnalysisResult<usize> {
        match self {
            Self::MaxRisingEdge => {
                if signal.len() < 2 {
                    return Err(AnalysisError::InvalidInput(format!(
                        "上升沿定位至少需要2个bin，实际 {}",
                        signal.len()
                    )));
                }
                let diffs: Vec<f64> = signal.windows(2).map(|w| w[1] - w[0]).collect();
                Ok(first_argmax(&diffs))
            }

            Self::MaxValue => {
                if signal.is_empty() {
                    return Err(AnalysisError::InvalidInput(
                        "空信号无法定位峰值".to_string(),
                    ));
                }
                Ok(first_argmax(signal))
            }
        }
    }

    fn policy_name(&self) -> &'static str {
        match self {
            Self::MaxRisingEdge => "MaxRisingEdge",
            Self::MaxValue => "MaxValue",
        }
    }
}

/// 第一个最大值索引（NaN 不参与比较）
fn first_argmax(values: &[f64]) -> usize {
    let mut best_index = 0;
    let mut best = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best {
            best = v;
            best_index = i;
        }
    }
    best_index
}

/// bin换算工具函数集合
pub mod utils {
    /// bin索引（可为小数，如平均bin）换算为相对零点的纳秒
    #[inline]
    pub fn bins_to_ns(bin: f64, zero_bin: usize, ns_per_bin: f64) -> f64 {
        (bin - zero_bin as f64) * ns_per_bin
    }

    /// 两个零点之间的偏移（bin）
    #[inline]
    pub fn zero_shift(zero_a: usize, zero_b: usize) -> isize {
        zero_a as isize - zero_b as isize
    }
}
