//! 核心算法模块
//!
//! 通道采样、时间窗口累加、背景扣除直方图、零点对齐、
//! 寿命估计与副本聚合。全部为单线程、同步、给定种子可复现。

pub mod accumulator;
pub mod aggregate;
pub mod alignment;
pub mod histogram;
pub mod lifetime;
pub mod sampler;

// 重新导出公共接口
pub use accumulator::{CountAccumulator, CountSnapshot, EmissionSource, EventLog, SignalDefinition};
pub use aggregate::{
    ChannelOrder, ConditionKey, ConditionSummary, MixturePlan, Population, ReplicateRecord,
    ReplicateSeries,
};
pub use alignment::{AlignmentPolicy, ZeroBinLocator};
pub use histogram::{
    BackgroundEntry, BackgroundTable, BinningConfig, DetectorHistogram, HistogramBuilder,
    PolarizationTrace, RawFrame,
};
pub use lifetime::{DecayModel, ExpComponent, FitResult, SignalKind, TailWindow};
pub use sampler::{Channel, ChannelCounts, ChannelSampler, EmissionEvent};
