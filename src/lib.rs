//! Tumbling Photon Engine
//!
//! 旋转扩散测量的偏振通道光子计数与衰减分析引擎。
//!
//! ## 核心特性
//! - 按发射偶极取向分配X/Y偏振通道（可播种、可复现）
//! - 时间窗口累加：每个事件只计数一次，支持分阶段计划
//! - TCSPC直方图：逐帧背景扣除、截取有效bin、跨采集求和
//! - 零点对齐策略（最陡上升沿 / 最大值）与平均到达时间
//! - 单/双指数尾部拟合（Levenberg-Marquardt），含参数标准误差
//! - 副本统计、混合物构建与稳态/时间分辨偏振

pub mod core;
pub mod error;
pub mod processing;
pub mod tools;

// 重新导出核心类型
pub use core::{
    AlignmentPolicy, ChannelCounts, ChannelSampler, CountAccumulator, DecayModel,
    DetectorHistogram, EmissionEvent, EventLog, SignalDefinition,
};
pub use error::{AnalysisError, AnalysisResult, ErrorCategory};
pub use tools::AnalysisConfig;
