//! 时间窗口计数累加器
//!
//! 在一次（模拟）实验的多个阶段中累加两通道计数：泵浦脉冲、延迟、
//! 探测脉冲、流式细胞仪的逐级激光等。每次调用只采样 `t > since_time`
//! 的事件，调用方负责在物理上不同的阶段之间推进 `since_time`，
//! 否则同一批事件会被重复计数。
//!
//! ## 职责边界
//!
//! - ✅ 时间截断、通道采样、运行总数与分阶段计数
//! - ✅ 累计计数轨迹快照（用于随时间的累计曲线）
//! - ❌ 分子状态演化（由外部模拟器负责，见 [`EmissionSource`]）

use super::sampler::{ChannelCounts, ChannelSampler, EmissionEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 信号定义："初态 → 末态" 跃迁，例如单重激发态衰减到基态
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub initial_state: String,
    pub final_state: String,
}

impl SignalDefinition {
    pub fn new(initial_state: impl Into<String>, final_state: impl Into<String>) -> Self {
        Self {
            initial_state: initial_state.into(),
            final_state: final_state.into(),
        }
    }

    /// 单重激发态 → 基态（荧光发射）
    pub fn singlet_emission() -> Self {
        Self::new("excited_singlet", "ground")
    }
}

impl std::fmt::Display for SignalDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.initial_state, self.final_state)
    }
}

/// 发射事件来源（外部模拟器的接缝）
///
/// 返回到目前为止记录的、属于指定跃迁的全部事件，按时间排序。
pub trait EmissionSource {
    fn transitions(&self, signal: &SignalDefinition) -> &[EmissionEvent];
}

/// 累计计数快照
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountSnapshot {
    /// 快照对应的实验时间
    pub time: f64,
    pub counts: ChannelCounts,
}

/// 时间窗口计数累加器（单写者）
#[derive(Debug, Clone)]
pub struct CountAccumulator {
    signal: SignalDefinition,
    sampler: ChannelSampler,
    totals: ChannelCounts,
    stages: BTreeMap<String, ChannelCounts>,
    stage_order: Vec<String>,
    last_window_start: Option<f64>,
    trace: Vec<CountSnapshot>,
}

impl CountAccumulator {
    /// 创建累加器
    pub fn new(signal: SignalDefinition, sampler: ChannelSampler) -> Self {
        Self {
            signal,
            sampler,
            totals: ChannelCounts::default(),
            stages: BTreeMap::new(),
            stage_order: Vec::new(),
            last_window_start: None,
            trace: Vec::new(),
        }
    }

    /// 使用固定种子创建累加器
    pub fn seeded(signal: SignalDefinition, seed: u64) -> Self {
        Self::new(signal, ChannelSampler::seeded(seed))
    }

    pub fn signal(&self) -> &SignalDefinition {
        &self.signal
    }

    /// 运行总计数
    pub fn totals(&self) -> ChannelCounts {
        self.totals
    }

    /// 最近一次窗口起点
    pub fn last_window_start(&self) -> Option<f64> {
        self.last_window_start
    }

    /// 采样 `t > since_time` 的事件并累加，返回本次增量
    pub fn accumulate(&mut self, events: &[EmissionEvent], since_time: f64) -> ChannelCounts {
        if let Some(previous) = self.last_window_start
            && since_time < previous
        {
            warn!(
                signal = %self.signal,
                previous,
                since_time,
                "窗口起点回退，可能重复计数"
            );
        }

        let mut sampled = 0usize;
        let window = events_after(events, since_time).inspect(|_| sampled += 1);
        let delta = self.sampler.count_batch(window);
        self.totals += delta;
        self.last_window_start = Some(since_time);

        debug!(
            signal = %self.signal,
            since_time,
            events = sampled,
            delta_x = delta.counts_x,
            delta_y = delta.counts_y,
            "累加窗口"
        );
        delta
    }

    /// 从事件来源读取本信号的事件后累加
    pub fn accumulate_from<S: EmissionSource + ?Sized>(
        &mut self,
        source: &S,
        since_time: f64,
    ) -> ChannelCounts {
        let signal = self.signal.clone();
        self.accumulate(source.transitions(&signal), since_time)
    }

    /// 累加到指定命名阶段（同时计入运行总数）
    pub fn accumulate_stage(
        &mut self,
        stage: &str,
        events: &[EmissionEvent],
        since_time: f64,
    ) -> ChannelCounts {
        let delta = self.accumulate(events, since_time);
        if !self.stages.contains_key(stage) {
            self.stage_order.push(stage.to_string());
        }
        *self.stages.entry(stage.to_string()).or_default() += delta;
        delta
    }

    /// 获取阶段计数
    pub fn stage_counts(&self, stage: &str) -> Option<ChannelCounts> {
        self.stages.get(stage).copied()
    }

    /// 按首次出现顺序列出所有阶段
    pub fn stages(&self) -> Vec<(&str, ChannelCounts)> {
        self.stage_order
            .iter()
            .filter_map(|name| self.stages.get(name).map(|c| (name.as_str(), *c)))
            .collect()
    }

    /// 记录当前运行总数的快照
    pub fn snapshot(&mut self, time: f64) -> CountSnapshot {
        let snap = CountSnapshot {
            time,
            counts: self.totals,
        };
        self.trace.push(snap);
        snap
    }

    /// 累计计数轨迹
    pub fn trace(&self) -> &[CountSnapshot] {
        &self.trace
    }

    /// 新副本开始：清空计数、阶段、游标和轨迹（保留随机数流）
    pub fn reset(&mut self) {
        self.totals = ChannelCounts::default();
        self.stages.clear();
        self.stage_order.clear();
        self.last_window_start = None;
        self.trace.clear();
    }
}

/// 遍历 `t > since_time` 的事件（不要求输入按时间排序）
pub fn events_after(
    events: &[EmissionEvent],
    since_time: f64,
) -> impl Iterator<Item = &EmissionEvent> {
    events.iter().filter(move |e| e.t > since_time)
}

/// 返回 `t <= checkpoint` 的事件切片（模拟器推进到检查点时的可见事件）
///
/// 要求事件按时间单调不减（[`EventLog`] 保证这一点）。
pub fn events_until(events: &[EmissionEvent], checkpoint: f64) -> &[EmissionEvent] {
    let end = events.partition_point(|e| e.t <= checkpoint);
    &events[..end]
}

/// 按信号分组保存的事件日志（来自模拟器导出表）
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    by_signal: BTreeMap<(String, String), Vec<EmissionEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个事件；同一信号内保持时间排序
    pub fn push(&mut self, signal: &SignalDefinition, event: EmissionEvent) {
        let list = self
            .by_signal
            .entry((signal.initial_state.clone(), signal.final_state.clone()))
            .or_default();
        if list.last().is_some_and(|last| last.t > event.t) {
            let pos = list.partition_point(|e| e.t <= event.t);
            list.insert(pos, event);
        } else {
            list.push(event);
        }
    }

    /// 日志中出现的所有信号
    pub fn signals(&self) -> Vec<SignalDefinition> {
        self.by_signal
            .keys()
            .map(|(i, f)| SignalDefinition::new(i.clone(), f.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_signal.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmissionSource for EventLog {
    fn transitions(&self, signal: &SignalDefinition) -> &[EmissionEvent] {
        self.by_signal
            .get(&(signal.initial_state.clone(), signal.final_state.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x_events(times: &[f64]) -> Vec<EmissionEvent> {
        times
            .iter()
            .map(|&t| EmissionEvent::new(1.0, 0.0, 0.0, t))
            .collect()
    }

    fn y_events(times: &[f64]) -> Vec<EmissionEvent> {
        times
            .iter()
            .map(|&t| EmissionEvent::new(0.0, 1.0, 0.0, t))
            .collect()
    }

    #[test]
    fn test_cutoff_is_strict() {
        let events = x_events(&[10.0, 50.0, 50.0, 51.0, 90.0]);
        let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), 0);
        let delta = acc.accumulate(&events, 50.0);
        assert_eq!(delta, ChannelCounts::new(2, 0));
        assert_eq!(acc.totals(), ChannelCounts::new(2, 0));
        assert_eq!(acc.last_window_start(), Some(50.0));
    }

    #[test]
    fn test_sequential_stages_do_not_double_count() {
        // 模拟器在两次检查点之间产生新事件，游标推进后只计入新事件
        let mut stream = x_events(&[20.0, 40.0, 60.0]);
        let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), 1);

        let first = acc.accumulate_stage("delay_100", &stream, 0.0);
        assert_eq!(first, ChannelCounts::new(3, 0));

        stream.extend(y_events(&[220.0, 240.0]));
        let second = acc.accumulate_stage("delay_200", &stream, 150.0);
        assert_eq!(second, ChannelCounts::new(0, 2));

        assert_eq!(acc.totals(), ChannelCounts::new(3, 2));
        assert_eq!(acc.stage_counts("delay_100"), Some(ChannelCounts::new(3, 0)));
        assert_eq!(acc.stage_counts("delay_200"), Some(ChannelCounts::new(0, 2)));
    }

    #[test]
    fn test_same_cutoff_without_new_events_adds_nothing_new_in_window() {
        // 相同since_time、两段不相交的事件流：只有在T之后真的有新事件时才增加
        let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), 2);
        let before_t = x_events(&[5.0, 8.0]);
        let delta = acc.accumulate(&before_t, 10.0);
        assert_eq!(delta, ChannelCounts::default());

        let after_t = y_events(&[12.0, 15.0, 19.0]);
        let delta = acc.accumulate(&after_t, 10.0);
        assert_eq!(delta, ChannelCounts::new(0, 3));
        assert_eq!(acc.totals(), ChannelCounts::new(0, 3));
    }

    #[test]
    fn test_unadvanced_cursor_double_counts_documented_behavior() {
        // 调用方未推进游标时同一批事件被计两次（调用方的不变量）
        let events = x_events(&[1.0, 2.0, 3.0]);
        let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), 3);
        acc.accumulate(&events, 0.0);
        acc.accumulate(&events, 0.0);
        assert_eq!(acc.totals(), ChannelCounts::new(6, 0));
    }

    #[test]
    fn test_deterministic_with_fixed_seed() {
        let events: Vec<EmissionEvent> = (0..2000)
            .map(|i| {
                let angle = i as f64 * 0.01;
                EmissionEvent::new(angle.cos() * 0.8, angle.sin() * 0.8, 0.6, i as f64)
            })
            .collect();

        let run = |seed| {
            let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), seed);
            acc.accumulate(&events, 100.0);
            acc.accumulate(&events, 1500.0);
            acc.totals()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_reset_and_trace() {
        let events = x_events(&[1.0, 2.0]);
        let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), 4);
        acc.accumulate(&events, 0.0);
        acc.snapshot(10.0);
        acc.accumulate(&x_events(&[11.0]), 10.0);
        acc.snapshot(20.0);

        let trace: Vec<u64> = acc.trace().iter().map(|s| s.counts.counts_x).collect();
        assert_eq!(trace, vec![2, 3]);

        acc.reset();
        assert_eq!(acc.totals(), ChannelCounts::default());
        assert!(acc.trace().is_empty());
        assert!(acc.stages().is_empty());
        assert_eq!(acc.last_window_start(), None);
    }

    #[test]
    fn test_event_log_source() {
        let mut log = EventLog::new();
        let singlet = SignalDefinition::singlet_emission();
        let triplet = SignalDefinition::new("excited_triplet", "ground");
        log.push(&singlet, EmissionEvent::new(1.0, 0.0, 0.0, 5.0));
        log.push(&singlet, EmissionEvent::new(1.0, 0.0, 0.0, 1.0));
        log.push(&triplet, EmissionEvent::new(0.0, 1.0, 0.0, 3.0));

        let times: Vec<f64> = log.transitions(&singlet).iter().map(|e| e.t).collect();
        assert_eq!(times, vec![1.0, 5.0]);
        assert_eq!(log.len(), 3);

        let mut acc = CountAccumulator::seeded(singlet, 0);
        assert_eq!(acc.accumulate_from(&log, 0.0), ChannelCounts::new(2, 0));
        assert!(log.transitions(&SignalDefinition::new("a", "b")).is_empty());
    }

    #[test]
    fn test_event_window_helpers() {
        let events = x_events(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(events_after(&events, 2.0).count(), 2);
        assert_eq!(events_until(&events, 2.0).len(), 2);
        assert_eq!(events_after(&events, 10.0).count(), 0);
    }

    #[test]
    fn test_unsorted_events_respect_cutoff() {
        // 直接传入的事件切片可能未排序，截止规则仍只看时间戳
        let events = x_events(&[1.0, 5.0, 2.0, 6.0, 0.5, 7.0]);
        let mut acc = CountAccumulator::seeded(SignalDefinition::singlet_emission(), 3);
        let delta = acc.accumulate(&events, 3.0);
        assert_eq!(delta, ChannelCounts::new(3, 0));

        let kept: Vec<f64> = events_after(&events, 3.0).map(|e| e.t).collect();
        assert_eq!(kept, vec![5.0, 6.0, 7.0]);
    }
}
