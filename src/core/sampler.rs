//! 偏振通道分配采样器
//!
//! 将发射瞬间偶极子取向 `(x, y, z)` 映射为探测通道标签。
//! 两个正交线偏振片后的探测概率：`p_x = x²`，`p_y = y²`，
//! 其余概率质量（沿z轴的分量）不被任何通道捕获。
//!
//! 概率模型只在 [`assign_channel`] 中实现一次，所有调用点共享。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// 单个发射事件（由外部转动扩散模拟器产生）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmissionEvent {
    /// 单位球取向分量
    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// 发射/跃迁时间（非负，副本内单调不减）
    pub t: f64,
}

impl EmissionEvent {
    pub fn new(x: f64, y: f64, z: f64, t: f64) -> Self {
        Self { x, y, z, t }
    }
}

/// 探测通道标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    X,
    Y,
    /// 未被任一通道捕获（吸收/未探测）
    Unassigned,
}

/// 两通道计数对
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub counts_x: u64,
    pub counts_y: u64,
}

impl ChannelCounts {
    pub fn new(counts_x: u64, counts_y: u64) -> Self {
        Self { counts_x, counts_y }
    }

    /// 两通道总计数
    #[inline]
    pub fn total(&self) -> u64 {
        self.counts_x + self.counts_y
    }

    /// 记录一个通道标签
    #[inline]
    pub fn record(&mut self, channel: Channel) {
        match channel {
            Channel::X => self.counts_x += 1,
            Channel::Y => self.counts_y += 1,
            Channel::Unassigned => {}
        }
    }

    /// 获取指定通道计数（Unassigned恒为0）
    #[inline]
    pub fn get(&self, channel: Channel) -> u64 {
        match channel {
            Channel::X => self.counts_x,
            Channel::Y => self.counts_y,
            Channel::Unassigned => 0,
        }
    }
}

impl std::ops::Add for ChannelCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            counts_x: self.counts_x + rhs.counts_x,
            counts_y: self.counts_y + rhs.counts_y,
        }
    }
}

impl std::ops::AddAssign for ChannelCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.counts_x += rhs.counts_x;
        self.counts_y += rhs.counts_y;
    }
}

impl std::iter::Sum for ChannelCounts {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, c| acc + c)
    }
}

/// 通道分配概率模型（纯函数）
///
/// `r` 为 `[0, 1)` 内的均匀随机数：
/// - `r < x²` → X
/// - `x² ≤ r < x² + y²` → Y
/// - 其余 → Unassigned
#[inline]
pub fn assign_channel(x: f64, y: f64, r: f64) -> Channel {
    let p_x = x * x;
    let p_y = y * y;
    if r < p_x {
        Channel::X
    } else if r < p_x + p_y {
        Channel::Y
    } else {
        Channel::Unassigned
    }
}

/// 可播种的批量通道采样器
///
/// 每个事件恰好消耗一次均匀随机抽样，因此相同种子和相同输入
/// 得到完全相同的结果。
#[derive(Debug, Clone)]
pub struct ChannelSampler {
    rng: StdRng,
}

impl ChannelSampler {
    /// 使用固定种子创建采样器（可复现）
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 为单个事件分配通道
    #[inline]
    pub fn assign(&mut self, event: &EmissionEvent) -> Channel {
        let r: f64 = self.rng.random();
        assign_channel(event.x, event.y, r)
    }

    /// 批量分配，返回逐事件标签
    pub fn assign_batch(&mut self, events: &[EmissionEvent]) -> Vec<Channel> {
        events.iter().map(|e| self.assign(e)).collect()
    }

    /// 批量分配，只返回两通道计数总和
    pub fn count_batch<'a, I>(&mut self, events: I) -> ChannelCounts
    where
        I: IntoIterator<Item = &'a EmissionEvent>,
    {
        let mut counts = ChannelCounts::default();
        for event in events {
            counts.record(self.assign(event));
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 单位球上均匀分布的取向（z均匀 + 方位角均匀）
    fn uniform_sphere(n: usize, seed: u64) -> Vec<EmissionEvent> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let z: f64 = 2.0 * rng.random::<f64>() - 1.0;
                let phi: f64 = 2.0 * std::f64::consts::PI * rng.random::<f64>();
                let rho = (1.0 - z * z).sqrt();
                EmissionEvent::new(rho * phi.cos(), rho * phi.sin(), z, i as f64)
            })
            .collect()
    }

    #[test]
    fn test_x_axis_always_x() {
        let mut sampler = ChannelSampler::seeded(7);
        let events = vec![EmissionEvent::new(1.0, 0.0, 0.0, 0.0); 10_000];
        let counts = sampler.count_batch(&events);
        assert_eq!(counts, ChannelCounts::new(10_000, 0));
    }

    #[test]
    fn test_y_axis_always_y() {
        let mut sampler = ChannelSampler::seeded(7);
        let events = vec![EmissionEvent::new(0.0, 1.0, 0.0, 0.0); 10_000];
        let counts = sampler.count_batch(&events);
        assert_eq!(counts, ChannelCounts::new(0, 10_000));
    }

    #[test]
    fn test_optical_axis_unassigned() {
        // 沿z轴发射：不报错，全部未分配
        let mut sampler = ChannelSampler::seeded(1);
        let events = vec![EmissionEvent::new(0.0, 0.0, 1.0, 0.0); 1000];
        let labels = sampler.assign_batch(&events);
        assert!(labels.iter().all(|&c| c == Channel::Unassigned));
    }

    #[test]
    fn test_boundary_draws() {
        // r=0 落在X；r 恰等于 p_x 时进入Y
        assert_eq!(assign_channel(0.5_f64.sqrt(), 0.5_f64.sqrt(), 0.0), Channel::X);
        assert_eq!(assign_channel(0.6, 0.8, 0.36), Channel::Y);
        assert_eq!(assign_channel(0.6, 0.0, 0.36), Channel::Unassigned);
    }

    #[test]
    fn test_uniform_sphere_fraction_matches_one_third() {
        let n = 1_000_000;
        let events = uniform_sphere(n, 2024);
        let mut sampler = ChannelSampler::seeded(99);
        let counts = sampler.count_batch(&events);

        let frac_x = counts.counts_x as f64 / n as f64;
        let frac_y = counts.counts_y as f64 / n as f64;
        // E[x²] = 1/3，标准误 ≈ 4.7e-4，取约10σ容差
        assert!((frac_x - 1.0 / 3.0).abs() < 5e-3, "frac_x = {frac_x}");
        assert!((frac_y - 1.0 / 3.0).abs() < 5e-3, "frac_y = {frac_y}");
    }

    #[test]
    fn test_seeded_sampler_is_reproducible() {
        let events = uniform_sphere(5000, 3);
        let a = ChannelSampler::seeded(11).assign_batch(&events);
        let b = ChannelSampler::seeded(11).assign_batch(&events);
        assert_eq!(a, b);
    }

    #[test]
    fn test_counts_arithmetic() {
        let total: ChannelCounts = [ChannelCounts::new(1, 2), ChannelCounts::new(3, 4)]
            .into_iter()
            .sum();
        assert_eq!(total, ChannelCounts::new(4, 6));
        assert_eq!(total.total(), 10);
        assert_eq!(total.get(Channel::Unassigned), 0);
    }
}
