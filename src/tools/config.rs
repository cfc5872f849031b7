//! 分析配置
//!
//! 所有仪器参数与策略选择集中在 [`AnalysisConfig`]，显式传入每个管线调用。
//! 可从JSON文件加载，缺省字段取 [`super::constants`] 中的默认值。

use super::constants::{defaults, fitting, tcspc};
use crate::core::aggregate::ChannelOrder;
use crate::core::alignment::AlignmentPolicy;
use crate::core::histogram::{BackgroundTable, BinningConfig};
use crate::core::lifetime::{DecayModel, TailWindow};
use crate::error::{AnalysisError, AnalysisResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 计数实验的一个阶段窗口
///
/// 采样 `since < t ≤ until` 的事件（`until` 缺省时不设上限）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWindow {
    pub name: String,
    pub since: f64,
    #[serde(default)]
    pub until: Option<f64>,
}

/// 背景表排除规则：丢弃某背景组中帧号小于 `before_frame` 的条目
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundExclusion {
    pub group: u32,
    pub before_frame: u32,
}

/// 逐帧平均到达时间所用的直方图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalWindow {
    /// 有效bin内、扣除背景（按 `clip_negative` 截断）后的直方图
    #[default]
    ActiveCorrected,
    /// 完整长度（含填充bin）逐bin扣除均摊背景，不截断
    FullLength,
}

/// 分析配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// 导出中每帧的总bin数（含填充）
    pub total_bins: usize,
    /// 保留的有效bin数
    pub active_bins: usize,
    pub ns_per_bin: f64,
    /// 拟合前丢弃的尾部bin数
    pub trim_bins: usize,
    /// 峰后跳过的bin数
    pub dead_time_offset: usize,
    /// 背景扣除后在0处截断
    pub clip_negative: bool,

    /// 逐帧平均到达时间的零点（原始触发帧信号之和）
    pub triggered_alignment: AlignmentPolicy,
    /// 即时信号零点
    pub prompt_alignment: AlignmentPolicy,
    /// 多日求和的触发信号零点（尾部拟合起点）
    pub summed_triggered_alignment: AlignmentPolicy,
    /// 逐帧平均到达时间的直方图范围
    pub frame_arrival_window: ArrivalWindow,

    pub prompt_model: DecayModel,
    pub triggered_model: DecayModel,
    pub single_guess: Vec<f64>,
    pub double_guess: Vec<f64>,

    /// 触发帧间隔（微秒）
    pub frame_period_us: f64,
    /// 只使用这些背景组（空表示全部）
    pub background_groups: Vec<u32>,
    /// 组内早期帧排除（同一帧号在多个组中出现时消除歧义）
    pub background_exclusions: Vec<BackgroundExclusion>,
    /// 垂直通道g因子
    pub g_factor: f64,

    pub seed: u64,
    pub channel_order: ChannelOrder,
    /// 事件计数的阶段计划
    pub stages: Vec<StageWindow>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            total_bins: tcspc::TOTAL_BINS,
            active_bins: tcspc::ACTIVE_BINS,
            ns_per_bin: tcspc::NS_PER_BIN,
            trim_bins: tcspc::TRIM_BINS,
            dead_time_offset: tcspc::DEAD_TIME_OFFSET,
            clip_negative: true,
            triggered_alignment: AlignmentPolicy::MaxRisingEdge,
            prompt_alignment: AlignmentPolicy::MaxValue,
            summed_triggered_alignment: AlignmentPolicy::MaxValue,
            frame_arrival_window: ArrivalWindow::ActiveCorrected,
            prompt_model: DecayModel::Double,
            triggered_model: DecayModel::Single,
            single_guess: fitting::SINGLE_EXP_GUESS.to_vec(),
            double_guess: fitting::DOUBLE_EXP_GUESS.to_vec(),
            frame_period_us: tcspc::FRAME_PERIOD_US,
            background_groups: Vec::new(),
            background_exclusions: Vec::new(),
            g_factor: 1.0,
            seed: defaults::SEED,
            channel_order: ChannelOrder::XMajor,
            stages: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    /// 从JSON文件加载并校验
    pub fn load(path: &Path) -> AnalysisResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            AnalysisError::FormatError(format!("配置文件 {} 解析失败: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 参数一致性检查
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.active_bins == 0 || self.active_bins > self.total_bins {
            return Err(AnalysisError::InvalidInput(format!(
                "active_bins={} 必须在 1..={} 之间",
                self.active_bins, self.total_bins
            )));
        }
        if self.trim_bins >= self.active_bins {
            return Err(AnalysisError::InvalidInput(format!(
                "trim_bins={} 不小于 active_bins={}",
                self.trim_bins, self.active_bins
            )));
        }
        if !(self.ns_per_bin > 0.0 && self.ns_per_bin.is_finite()) {
            return Err(AnalysisError::InvalidInput(format!(
                "ns_per_bin={} 必须为正",
                self.ns_per_bin
            )));
        }
        if self.single_guess.len() != 2 || self.double_guess.len() != 4 {
            return Err(AnalysisError::InvalidInput(
                "初值长度应为 2（单指数）与 4（双指数）".to_string(),
            ));
        }
        if let Some(stage) = self
            .stages
            .iter()
            .find(|s| s.until.is_some_and(|until| until < s.since))
        {
            return Err(AnalysisError::InvalidInput(format!(
                "阶段 '{}' 的 until 早于 since",
                stage.name
            )));
        }
        Ok(())
    }

    /// 直方图构建参数
    pub fn binning(&self) -> BinningConfig {
        BinningConfig {
            active_bins: self.active_bins,
            ns_per_bin: self.ns_per_bin,
            clip_negative: self.clip_negative,
        }
    }

    /// 尾部拟合窗口
    pub fn tail_window(&self) -> TailWindow {
        TailWindow {
            dead_time_offset: self.dead_time_offset,
            active_bins: self.active_bins,
            trim_bins: self.trim_bins,
            ns_per_bin: self.ns_per_bin,
        }
    }

    /// 指定模型的初值
    pub fn guess_for(&self, model: DecayModel) -> &[f64] {
        match model {
            DecayModel::Single => &self.single_guess,
            DecayModel::Double => &self.double_guess,
        }
    }

    /// 按背景组与排除规则筛选背景表
    pub fn select_background(&self, table: BackgroundTable) -> BackgroundTable {
        let table = if self.background_groups.is_empty() {
            table
        } else {
            table.restrict_groups(&self.background_groups)
        };
        table.retain(|e| {
            !self
                .background_exclusions
                .iter()
                .any(|x| x.group == e.bkgd_group && e.frame < x.before_frame)
        })
    }

    /// 触发帧对应的泵浦-探测延迟（微秒）
    #[inline]
    pub fn frame_delay_us(&self, frame: u32) -> f64 {
        (frame.saturating_sub(1)) as f64 * self.frame_period_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_instrument() {
        let config = AnalysisConfig::default();
        assert_eq!(config.total_bins, 128);
        assert_eq!(config.active_bins, 100);
        assert!((config.ns_per_bin - 0.125).abs() < 1e-15);
        assert_eq!(config.tail_window().range(10), 12..92);
        assert_eq!(config.triggered_alignment, AlignmentPolicy::MaxRisingEdge);
        assert_eq!(config.prompt_alignment, AlignmentPolicy::MaxValue);
        assert_eq!(config.frame_arrival_window, ArrivalWindow::ActiveCorrected);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "clip_negative": false,
            "triggered_alignment": "max_value",
            "frame_arrival_window": "full_length",
            "stages": [{"name": "pump", "since": 0.0, "until": 50.0}]
        }"#;
        let config: AnalysisConfig = serde_json::from_str(json).unwrap();
        assert!(!config.clip_negative);
        assert_eq!(config.triggered_alignment, AlignmentPolicy::MaxValue);
        assert_eq!(config.frame_arrival_window, ArrivalWindow::FullLength);
        assert_eq!(config.active_bins, 100);
        assert_eq!(config.stages[0].until, Some(50.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_windows() {
        let config = AnalysisConfig {
            trim_bins: 100,
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            stages: vec![StageWindow {
                name: "probe".to_string(),
                since: 10.0,
                until: Some(5.0),
            }],
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_background_selection() {
        use crate::core::histogram::BackgroundEntry;
        let entry = |frame, bkgd_group| BackgroundEntry {
            frame,
            bkgd_group,
            bkgd_a: 1.0,
            bkgd_b: 1.0,
        };
        let table = BackgroundTable::new(vec![
            entry(1, 7),
            entry(1, 8),
            entry(9, 8),
            entry(2, 3),
        ]);
        let config = AnalysisConfig {
            background_groups: vec![7, 8],
            background_exclusions: vec![BackgroundExclusion {
                group: 8,
                before_frame: 9,
            }],
            ..AnalysisConfig::default()
        };
        let selected = config.select_background(table);
        assert_eq!(selected.lookup(1).unwrap().bkgd_group, 7);
        assert_eq!(selected.lookup(9).unwrap().bkgd_group, 8);
        assert!(selected.lookup(2).is_err());
    }

    #[test]
    fn test_frame_delay() {
        let config = AnalysisConfig::default();
        assert_eq!(config.frame_delay_us(1), 0.0);
        assert_eq!(config.frame_delay_us(9), 480.0);
    }
}
