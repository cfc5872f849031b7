//! 副本与混合物聚合
//!
//! 副本计数表按物理条件（群体、延迟、饱和度）分组，计算均值与样本标准差；
//! 不同群体的副本序列按延迟逐点相加得到混合物。

use super::sampler::ChannelCounts;
use crate::error::{AnalysisError, AnalysisResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 群体标签：单一扩散时间，或混合物的多个扩散时间
///
/// 显示为 `450` 或 `450-3000`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub components: Vec<f64>,
}

impl Population {
    pub fn single(diffusion_time_ns: f64) -> Self {
        Self {
            components: vec![diffusion_time_ns],
        }
    }

    /// 合并为混合物标签（保持组成顺序）
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Population>) -> Self {
        Self {
            components: parts
                .into_iter()
                .flat_map(|p| p.components.iter().copied())
                .collect(),
        }
    }

    pub fn is_mixture(&self) -> bool {
        self.components.len() > 1
    }
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", labels.join("-"))
    }
}

impl FromStr for Population {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .split('-')
            .map(|part| {
                part.trim().parse::<f64>().map_err(|_| {
                    AnalysisError::InvalidInput(format!("无法解析群体标签 '{s}'"))
                })
            })
            .collect::<AnalysisResult<Vec<f64>>>()?;
        Ok(Self { components })
    }
}

impl Eq for Population {}

impl Ord for Population {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.components.iter().zip(&other.components) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for Population {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 条件键：群体 × 延迟 × 饱和度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionKey {
    pub population: Population,
    pub delay_time_ns: f64,
    pub saturation: Option<f64>,
}

impl Eq for ConditionKey {}

impl Ord for ConditionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.population
            .cmp(&other.population)
            .then_with(|| self.delay_time_ns.total_cmp(&other.delay_time_ns))
            .then_with(|| match (self.saturation, other.saturation) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                (a, b) => a.is_some().cmp(&b.is_some()),
            })
    }
}

impl PartialOrd for ConditionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 单个副本在单个条件下的计数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRecord {
    pub key: ConditionKey,
    pub replicate: u32,
    pub counts: ChannelCounts,
}

/// 偏振计算时的主/次通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    /// X为主通道（平行）
    #[default]
    XMajor,
    /// Y为主通道
    YMajor,
}

impl ChannelOrder {
    /// 返回 (major, minor)
    #[inline]
    pub fn split(&self, counts: ChannelCounts) -> (f64, f64) {
        let (x, y) = (counts.counts_x as f64, counts.counts_y as f64);
        match self {
            Self::XMajor => (x, y),
            Self::YMajor => (y, x),
        }
    }
}

/// 偏振 `(major - minor) / (major + minor)`，总数为0时为NaN
pub fn polarization(counts: ChannelCounts, order: ChannelOrder) -> f64 {
    let (major, minor) = order.split(counts);
    if major + minor == 0.0 {
        f64::NAN
    } else {
        (major - minor) / (major + minor)
    }
}

/// 稳态偏振与各向异性（g因子作用于次通道）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SteadyState {
    pub polarization: f64,
    pub anisotropy: f64,
}

impl SteadyState {
    pub fn from_counts(counts: ChannelCounts, order: ChannelOrder, g_factor: f64) -> Self {
        let (para, perp) = order.split(counts);
        let perp = perp * g_factor;
        let ratio = |num: f64, den: f64| if den == 0.0 { f64::NAN } else { num / den };
        Self {
            polarization: ratio(para - perp, para + perp),
            anisotropy: ratio(para - perp, para + 2.0 * perp),
        }
    }
}

/// 均值与样本标准差（ddof = 1；单个样本时标准差为NaN）
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

/// 单个条件的统计摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionSummary {
    pub key: ConditionKey,
    pub n_replicates: usize,
    pub mean_x: f64,
    pub std_x: f64,
    pub mean_y: f64,
    pub std_y: f64,
    pub mean_polarization: f64,
    pub std_polarization: f64,
}

/// 按条件分组并统计（结果按条件键排序）
pub fn summarize(records: &[ReplicateRecord], order: ChannelOrder) -> Vec<ConditionSummary> {
    let groups = records.iter().fold(
        BTreeMap::<&ConditionKey, Vec<ChannelCounts>>::new(),
        |mut acc, r| {
            acc.entry(&r.key).or_default().push(r.counts);
            acc
        },
    );

    groups
        .into_iter()
        .map(|(key, counts)| {
            let xs: Vec<f64> = counts.iter().map(|c| c.counts_x as f64).collect();
            let ys: Vec<f64> = counts.iter().map(|c| c.counts_y as f64).collect();
            let ps: Vec<f64> = counts.iter().map(|c| polarization(*c, order)).collect();
            let (mean_x, std_x) = mean_and_std(&xs);
            let (mean_y, std_y) = mean_and_std(&ys);
            let (mean_polarization, std_polarization) = mean_and_std(&ps);
            ConditionSummary {
                key: key.clone(),
                n_replicates: counts.len(),
                mean_x,
                std_x,
                mean_y,
                std_y,
                mean_polarization,
                std_polarization,
            }
        })
        .collect()
}

/// 一个副本沿延迟轴的计数序列
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicateSeries {
    pub population: Population,
    pub replicate: u32,
    pub saturation: Option<f64>,
    /// (delay_time_ns, counts)，按延迟升序
    pub points: Vec<(f64, ChannelCounts)>,
}

impl ReplicateSeries {
    /// 延迟轴
    pub fn delays(&self) -> Vec<f64> {
        self.points.iter().map(|(d, _)| *d).collect()
    }

    /// 展开为逐延迟的副本记录
    pub fn to_records(&self) -> Vec<ReplicateRecord> {
        self.points
            .iter()
            .map(|&(delay, counts)| ReplicateRecord {
                key: ConditionKey {
                    population: self.population.clone(),
                    delay_time_ns: delay,
                    saturation: self.saturation,
                },
                replicate: self.replicate,
                counts,
            })
            .collect()
    }
}

/// 将记录整理为 (群体, 饱和度, 副本) 序列
pub fn series_from_records(records: &[ReplicateRecord]) -> Vec<ReplicateSeries> {
    let mut grouped: BTreeMap<(Population, u32, Option<u64>), ReplicateSeries> = BTreeMap::new();
    for r in records {
        let sat_bits = r.key.saturation.map(f64::to_bits);
        grouped
            .entry((r.key.population.clone(), r.replicate, sat_bits))
            .or_insert_with(|| ReplicateSeries {
                population: r.key.population.clone(),
                replicate: r.replicate,
                saturation: r.key.saturation,
                points: Vec::new(),
            })
            .points
            .push((r.key.delay_time_ns, r.counts));
    }
    grouped
        .into_values()
        .map(|mut s| {
            s.points.sort_by(|a, b| a.0.total_cmp(&b.0));
            s
        })
        .collect()
}

/// 逐延迟相加多个副本序列，得到混合物序列
///
/// 所有序列的延迟轴必须完全一致。混合物副本编号取第一个序列的编号。
pub fn mix_series(series: &[&ReplicateSeries]) -> AnalysisResult<ReplicateSeries> {
    let first = series
        .first()
        .ok_or_else(|| AnalysisError::InvalidInput("混合物至少需要一个副本序列".to_string()))?;
    let axis = first.delays();

    for s in &series[1..] {
        if s.delays() != axis {
            return Err(AnalysisError::ShapeMismatch(format!(
                "延迟轴不一致: {}#{} 与 {}#{}",
                first.population, first.replicate, s.population, s.replicate
            )));
        }
    }

    let points = axis
        .iter()
        .enumerate()
        .map(|(i, &delay)| (delay, series.iter().map(|s| s.points[i].1).sum::<ChannelCounts>()))
        .collect();

    Ok(ReplicateSeries {
        population: Population::combine(series.iter().map(|s| &s.population)),
        replicate: first.replicate,
        saturation: first.saturation,
        points,
    })
}

/// 混合方案：若干 (群体, 副本) 组成一个混合物
///
/// 文本形式 `450:0+3000:0`；同一群体出现多次即构成非50/50的比例。
#[derive(Debug, Clone, PartialEq)]
pub struct MixturePlan {
    pub parts: Vec<(Population, u32)>,
}

impl FromStr for MixturePlan {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split('+')
            .map(|part| {
                let (pop, rep) = part.split_once(':').ok_or_else(|| {
                    AnalysisError::InvalidInput(format!("混合项 '{part}' 应为 POP:REP"))
                })?;
                let replicate = rep.trim().parse::<u32>().map_err(|_| {
                    AnalysisError::InvalidInput(format!("无法解析副本编号 '{rep}'"))
                })?;
                Ok((pop.parse::<Population>()?, replicate))
            })
            .collect::<AnalysisResult<Vec<_>>>()?;
        if parts.is_empty() {
            return Err(AnalysisError::InvalidInput("空混合方案".to_string()));
        }
        Ok(Self { parts })
    }
}

impl MixturePlan {
    /// 在已有序列中查找各组成并相加
    pub fn apply(&self, series: &[ReplicateSeries]) -> AnalysisResult<ReplicateSeries> {
        let selected = self
            .parts
            .iter()
            .map(|(pop, rep)| {
                series
                    .iter()
                    .find(|s| &s.population == pop && s.replicate == *rep)
                    .ok_or_else(|| {
                        AnalysisError::LookupError(format!("找不到副本序列 {pop}#{rep}"))
                    })
            })
            .collect::<AnalysisResult<Vec<_>>>()?;
        mix_series(&selected)
    }
}

/// 多条归一化曲线的逐点均值与样本标准差
pub fn trace_statistics(traces: &[Vec<f64>]) -> AnalysisResult<(Vec<f64>, Vec<f64>)> {
    let Some(first) = traces.first() else {
        return Ok((Vec::new(), Vec::new()));
    };
    if traces.iter().any(|t| t.len() != first.len()) {
        return Err(AnalysisError::ShapeMismatch(
            "归一化曲线长度不一致".to_string(),
        ));
    }
    Ok((0..first.len())
        .map(|i| {
            let column: Vec<f64> = traces.iter().map(|t| t[i]).collect();
            mean_and_std(&column)
        })
        .unzip())
}
