//! 扣除背景的时间bin直方图
//!
//! TCSPC导出为每帧、每通道的逐bin原始计数（含尾部填充bin）。
//! 本模块负责：
//! - 截取前 `active_bins` 个有效bin（其余为仪器填充）
//! - 按帧号精确查找背景总量并均摊到每个bin后扣除
//! - 多帧、多日（同一物理条件）直方图求和
//! - 由事件时间戳直接分箱，得到时间分辨的两通道衰减
//!
//! 原始数据从不被修改，所有结果都是派生数组。

use super::sampler::{Channel, EmissionEvent};
use crate::error::{AnalysisError, AnalysisResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 两通道（A/B探测器）直方图
///
/// 对模拟事件：A 对应 X 通道，B 对应 Y 通道。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorHistogram {
    /// 每bin纳秒数
    pub ns_per_bin: f64,

    /// 探测器A逐bin计数
    pub channel_a: Vec<f64>,

    /// 探测器B逐bin计数
    pub channel_b: Vec<f64>,
}

impl DetectorHistogram {
    /// 创建全零直方图
    pub fn zeros(n_bins: usize, ns_per_bin: f64) -> Self {
        Self {
            ns_per_bin,
            channel_a: vec![0.0; n_bins],
            channel_b: vec![0.0; n_bins],
        }
    }

    /// 从两通道数组创建（长度必须一致）
    pub fn from_channels(
        channel_a: Vec<f64>,
        channel_b: Vec<f64>,
        ns_per_bin: f64,
    ) -> AnalysisResult<Self> {
        if channel_a.len() != channel_b.len() {
            return Err(AnalysisError::ShapeMismatch(format!(
                "通道长度不一致: A={} B={}",
                channel_a.len(),
                channel_b.len()
            )));
        }
        Ok(Self {
            ns_per_bin,
            channel_a,
            channel_b,
        })
    }

    /// bin数量
    pub fn len(&self) -> usize {
        self.channel_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel_a.is_empty()
    }

    /// 两通道逐bin求和（A + B）
    pub fn combined(&self) -> Vec<f64> {
        self.channel_a
            .iter()
            .zip(&self.channel_b)
            .map(|(a, b)| a + b)
            .collect()
    }

    /// bin起点时间（纳秒，未对齐）
    pub fn time_axis_ns(&self) -> Vec<f64> {
        (0..self.len()).map(|i| i as f64 * self.ns_per_bin).collect()
    }

    /// 累加另一直方图（bin数必须一致）
    pub fn accumulate(&mut self, other: &DetectorHistogram) -> AnalysisResult<()> {
        if other.len() != self.len() {
            return Err(AnalysisError::ShapeMismatch(format!(
                "直方图bin数不一致: {} vs {}",
                self.len(),
                other.len()
            )));
        }
        for (dst, src) in self.channel_a.iter_mut().zip(&other.channel_a) {
            *dst += src;
        }
        for (dst, src) in self.channel_b.iter_mut().zip(&other.channel_b) {
            *dst += src;
        }
        Ok(())
    }
}

/// 一帧原始探测器计数（完整长度，含填充）
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// 触发帧号（从1开始）
    pub frame: u32,
    pub channel_a: Vec<f64>,
    pub channel_b: Vec<f64>,
}

impl RawFrame {
    /// 原始两通道之和（完整长度）
    pub fn combined(&self) -> Vec<f64> {
        self.channel_a
            .iter()
            .zip(&self.channel_b)
            .map(|(a, b)| a + b)
            .collect()
    }
}

/// 背景表条目
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundEntry {
    pub frame: u32,
    pub bkgd_group: u32,
    pub bkgd_a: f64,
    pub bkgd_b: f64,
}

/// 按帧查找的背景表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackgroundTable {
    entries: Vec<BackgroundEntry>,
}

impl BackgroundTable {
    pub fn new(entries: Vec<BackgroundEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[BackgroundEntry] {
        &self.entries
    }

    /// 只保留指定背景组
    pub fn restrict_groups(mut self, groups: &[u32]) -> Self {
        self.entries.retain(|e| groups.contains(&e.bkgd_group));
        self
    }

    /// 按条件过滤条目
    pub fn retain<F: FnMut(&BackgroundEntry) -> bool>(mut self, keep: F) -> Self {
        self.entries.retain(keep);
        self
    }

    /// 精确匹配帧号，要求唯一
    pub fn lookup(&self, frame: u32) -> AnalysisResult<&BackgroundEntry> {
        let mut matches = self.entries.iter().filter(|e| e.frame == frame);
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry),
            (None, _) => Err(AnalysisError::LookupError(format!(
                "帧 {frame} 没有背景条目"
            ))),
            (Some(_), Some(_)) => Err(AnalysisError::LookupError(format!(
                "帧 {frame} 的背景条目不唯一（{} 个匹配）",
                self.entries.iter().filter(|e| e.frame == frame).count()
            ))),
        }
    }
}

/// 直方图构建参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinningConfig {
    /// 保留的有效bin数
    pub active_bins: usize,
    pub ns_per_bin: f64,
    /// 扣除后是否在0处截断
    pub clip_negative: bool,
}

/// 截取前 `n_bins` 个bin并扣除均摊背景
///
/// `corrected[i] = raw[i] - bkgd_total / n_bins`
pub fn subtract_background(
    raw: &[f64],
    bkgd_total: f64,
    n_bins: usize,
    clip_negative: bool,
) -> AnalysisResult<Vec<f64>> {
    if n_bins == 0 {
        return Err(AnalysisError::InvalidInput("有效bin数不能为0".to_string()));
    }
    if raw.len() < n_bins {
        return Err(AnalysisError::ShapeMismatch(format!(
            "原始数据只有 {} 个bin，少于有效bin数 {n_bins}",
            raw.len()
        )));
    }

    let per_bin = bkgd_total / n_bins as f64;
    let mut clipped = 0usize;
    let corrected: Vec<f64> = raw[..n_bins]
        .iter()
        .map(|&value| {
            let v = value - per_bin;
            if clip_negative && v < 0.0 {
                clipped += 1;
                0.0
            } else {
                v
            }
        })
        .collect();

    if clipped > 0 {
        warn!(clipped, per_bin, "背景扣除后出现负值，已截断为0");
    }
    Ok(corrected)
}

fn subtract_full_length(raw: &[f64], bkgd_total: f64, n_bins: usize) -> AnalysisResult<Vec<f64>> {
    if n_bins == 0 {
        return Err(AnalysisError::InvalidInput("有效bin数不能为0".to_string()));
    }
    let per_bin = bkgd_total / n_bins as f64;
    Ok(raw.iter().map(|&value| value - per_bin).collect())
}

/// 背景扣除直方图构建器
#[derive(Debug, Clone, Copy)]
pub struct HistogramBuilder {
    config: BinningConfig,
}

impl HistogramBuilder {
    pub fn new(config: BinningConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BinningConfig {
        &self.config
    }

    /// 单帧：查找背景并扣除
    pub fn correct_frame(
        &self,
        frame: &RawFrame,
        background: &BackgroundTable,
    ) -> AnalysisResult<DetectorHistogram> {
        let entry = background.lookup(frame.frame)?;
        let n = self.config.active_bins;
        let clip = self.config.clip_negative;
        DetectorHistogram::from_channels(
            subtract_background(&frame.channel_a, entry.bkgd_a, n, clip)?,
            subtract_background(&frame.channel_b, entry.bkgd_b, n, clip)?,
            self.config.ns_per_bin,
        )
    }

    /// 单帧完整长度（含填充bin）的两通道之和，逐bin扣除均摊背景，不截断
    ///
    /// 均摊背景仍按有效bin数计算：`raw[i] - bkgd_total / active_bins`。
    pub fn full_length_combined(
        &self,
        frame: &RawFrame,
        background: &BackgroundTable,
    ) -> AnalysisResult<Vec<f64>> {
        let entry = background.lookup(frame.frame)?;
        let n = frame.channel_a.len().min(frame.channel_b.len());
        let active = self.config.active_bins;
        let a = subtract_full_length(&frame.channel_a[..n], entry.bkgd_a, active)?;
        let b = subtract_full_length(&frame.channel_b[..n], entry.bkgd_b, active)?;
        Ok(a.iter().zip(&b).map(|(x, y)| x + y).collect())
    }

    /// 无背景表的截取（例如已扣除背景的即时信号导出）
    pub fn truncate_frame(&self, frame: &RawFrame) -> AnalysisResult<DetectorHistogram> {
        let n = self.config.active_bins;
        DetectorHistogram::from_channels(
            subtract_background(&frame.channel_a, 0.0, n, false)?,
            subtract_background(&frame.channel_b, 0.0, n, false)?,
            self.config.ns_per_bin,
        )
    }

    /// 一次采集中所有帧的扣背景直方图之和
    pub fn sum_frames(
        &self,
        frames: &[RawFrame],
        background: &BackgroundTable,
    ) -> AnalysisResult<DetectorHistogram> {
        let mut total = DetectorHistogram::zeros(self.config.active_bins, self.config.ns_per_bin);
        for frame in frames {
            total.accumulate(&self.correct_frame(frame, background)?)?;
        }
        Ok(total)
    }
}

/// 多个等效采集（同一物理条件、不同日期）的直方图求和
pub fn sum_histograms(histograms: &[DetectorHistogram]) -> AnalysisResult<DetectorHistogram> {
    let first = histograms
        .first()
        .ok_or_else(|| AnalysisError::InvalidInput("没有可求和的直方图".to_string()))?;
    let mut total = DetectorHistogram::zeros(first.len(), first.ns_per_bin);
    for h in histograms {
        total.accumulate(h)?;
    }
    Ok(total)
}

/// 按事件时间戳对X/Y通道分箱
///
/// bin `i` 覆盖 `[start + i·width, start + (i+1)·width)`，最后一个bin包含右端点。
/// 区间外、时间戳非有限值的事件与未分配事件被忽略。
pub fn bin_event_times(
    events: &[EmissionEvent],
    labels: &[Channel],
    start: f64,
    bin_width: f64,
    n_bins: usize,
) -> AnalysisResult<DetectorHistogram> {
    if events.len() != labels.len() {
        return Err(AnalysisError::ShapeMismatch(format!(
            "事件数 {} 与标签数 {} 不一致",
            events.len(),
            labels.len()
        )));
    }
    if bin_width <= 0.0 || !bin_width.is_finite() || n_bins == 0 {
        return Err(AnalysisError::InvalidInput(format!(
            "非法分箱参数: width={bin_width}, bins={n_bins}"
        )));
    }

    let mut hist = DetectorHistogram::zeros(n_bins, bin_width);
    let stop = start + bin_width * n_bins as f64;
    for (event, &label) in events.iter().zip(labels) {
        if !event.t.is_finite() || event.t < start || event.t > stop {
            continue;
        }
        let index = (((event.t - start) / bin_width) as usize).min(n_bins - 1);
        match label {
            Channel::X => hist.channel_a[index] += 1.0,
            Channel::Y => hist.channel_b[index] += 1.0,
            Channel::Unassigned => {}
        }
    }
    Ok(hist)
}

/// 按最大值归一化（最大值非正时返回NaN序列）
pub fn normalize_to_max(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > 0.0 {
        values.iter().map(|v| v / max).collect()
    } else {
        vec![f64::NAN; values.len()]
    }
}

/// 时间分辨偏振/各向异性曲线
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolarizationTrace {
    /// `para / (g·perp)`
    pub ratio: Vec<f64>,
    /// `(para - g·perp) / (para + 2g·perp)`
    pub anisotropy: Vec<f64>,
    /// `(para - g·perp) / (para + g·perp)`
    pub polarization: Vec<f64>,
}

impl PolarizationTrace {
    /// 逐bin计算，g因子作用于垂直通道；分母为0时得到NaN
    pub fn compute(para: &[f64], perp: &[f64], g_factor: f64) -> AnalysisResult<Self> {
        if para.len() != perp.len() {
            return Err(AnalysisError::ShapeMismatch(format!(
                "平行/垂直通道长度不一致: {} vs {}",
                para.len(),
                perp.len()
            )));
        }
        let safe_div = |num: f64, den: f64| if den == 0.0 { f64::NAN } else { num / den };

        let mut trace = Self {
            ratio: Vec::with_capacity(para.len()),
            anisotropy: Vec::with_capacity(para.len()),
            polarization: Vec::with_capacity(para.len()),
        };
        for (&p, &s) in para.iter().zip(perp) {
            let s = s * g_factor;
            trace.ratio.push(safe_div(p, s));
            trace.anisotropy.push(safe_div(p - s, p + 2.0 * s));
            trace.polarization.push(safe_div(p - s, p + s));
        }
        Ok(trace)
    }
}
