//! 分析管线模块
//!
//! 把核心算法串成三条管线：事件计数、TCSPC衰减分析、副本聚合。
//! 每条管线只接收已解析的数据与 [`AnalysisConfig`]，不做文件I/O。

use super::config::{AnalysisConfig, ArrivalWindow, StageWindow};
use crate::core::accumulator::{
    events_until, CountAccumulator, CountSnapshot, EmissionSource, EventLog, SignalDefinition,
};
use crate::core::aggregate::{
    self, ChannelOrder, ConditionSummary, MixturePlan, ReplicateRecord, ReplicateSeries,
    SteadyState,
};
use crate::core::alignment::{AlignmentPolicy, ZeroBinLocator};
use crate::core::histogram::{
    self, BackgroundTable, DetectorHistogram, HistogramBuilder, PolarizationTrace, RawFrame,
};
use crate::core::lifetime::{self, DecayModel, FitResult, SignalKind};
use crate::core::sampler::{ChannelCounts, ChannelSampler};
use crate::error::{AnalysisError, AnalysisResult};
use serde::Serialize;
use tracing::info;

// ==================== 事件计数 ====================

/// 单个阶段的计数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageCounts {
    pub name: String,
    pub since: f64,
    pub until: Option<f64>,
    pub counts: ChannelCounts,
}

/// 事件时间分箱参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBinning {
    pub start: f64,
    pub bin_width: f64,
    pub n_bins: usize,
}

/// 事件计数结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountReport {
    pub signal: SignalDefinition,
    pub stages: Vec<StageCounts>,
    pub totals: ChannelCounts,
    /// 每个阶段结束时的累计计数
    pub trace: Vec<CountSnapshot>,
    pub steady_state: SteadyState,
}

/// 事件时间分辨结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeResolvedReport {
    pub histogram: DetectorHistogram,
    pub start: f64,
    pub polarization: PolarizationTrace,
}

/// 按阶段计划累加一个信号的通道计数
///
/// 阶段计划为空时使用单一阶段 `all`（全部事件）。每个阶段只看到
/// `until` 之前已发生的事件，并只采样 `t > since` 的部分。
pub fn count_events(
    log: &EventLog,
    signal: &SignalDefinition,
    config: &AnalysisConfig,
) -> AnalysisResult<CountReport> {
    let events = log.transitions(signal);
    if events.is_empty() {
        return Err(AnalysisError::InvalidInput(format!(
            "事件表中没有信号 {signal} 的事件"
        )));
    }

    let plan = if config.stages.is_empty() {
        vec![StageWindow {
            name: "all".to_string(),
            since: f64::NEG_INFINITY,
            until: None,
        }]
    } else {
        config.stages.clone()
    };

    let last_time = events.last().map_or(0.0, |e| e.t);
    let mut acc = CountAccumulator::seeded(signal.clone(), config.seed);
    let mut stages = Vec::with_capacity(plan.len());

    for stage in &plan {
        let visible = match stage.until {
            Some(until) => events_until(events, until),
            None => events,
        };
        let counts = acc.accumulate_stage(&stage.name, visible, stage.since);
        acc.snapshot(stage.until.unwrap_or(last_time));
        info!(stage = %stage.name, x = counts.counts_x, y = counts.counts_y, "阶段计数完成");
        stages.push(StageCounts {
            name: stage.name.clone(),
            since: stage.since,
            until: stage.until,
            counts,
        });
    }

    let totals = acc.totals();
    Ok(CountReport {
        signal: signal.clone(),
        stages,
        totals,
        trace: acc.trace().to_vec(),
        steady_state: SteadyState::from_counts(totals, config.channel_order, config.g_factor),
    })
}

/// 事件时间直方图与时间分辨偏振
///
/// 通道标签是一次独立抽样：种子与 [`count_events`] 相同，但后者按阶段窗口
/// 消耗随机数，两者的逐事件标签并不对应，只在统计上一致。
/// 平行/垂直通道由 `channel_order` 决定。
pub fn time_resolved(
    log: &EventLog,
    signal: &SignalDefinition,
    binning: TimeBinning,
    config: &AnalysisConfig,
) -> AnalysisResult<TimeResolvedReport> {
    let events = log.transitions(signal);
    let labels = ChannelSampler::seeded(config.seed).assign_batch(events);
    let histogram = histogram::bin_event_times(
        events,
        &labels,
        binning.start,
        binning.bin_width,
        binning.n_bins,
    )?;
    let (para, perp) = match config.channel_order {
        ChannelOrder::XMajor => (&histogram.channel_a, &histogram.channel_b),
        ChannelOrder::YMajor => (&histogram.channel_b, &histogram.channel_a),
    };
    let polarization = PolarizationTrace::compute(para, perp, config.g_factor)?;
    Ok(TimeResolvedReport {
        start: binning.start,
        histogram,
        polarization,
    })
}

// ==================== TCSPC 衰减分析 ====================

/// 一次触发帧采集（一天/一个样本）
#[derive(Debug, Clone)]
pub struct TriggeredDataset {
    pub label: String,
    pub frames: Vec<RawFrame>,
    pub background: BackgroundTable,
}

/// 单帧平均到达时间
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameArrival {
    pub dataset: String,
    pub frame: u32,
    pub delay_us: f64,
    pub mean_arrival_ns: f64,
}

/// 单个采集扣除背景并求和后的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub label: String,
    pub zero_bin: usize,
    pub histogram: DetectorHistogram,
}

/// 一类信号（即时/触发）的求和衰减与拟合
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSummary {
    pub kind: SignalKind,
    pub histogram: DetectorHistogram,
    pub zero_bin: usize,
    pub mean_arrival_ns: f64,
    pub fit: FitResult,
}

/// 跨采集的峰值归一化衰减曲线统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedProfile {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// TCSPC分析结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcspcReport {
    pub datasets: Vec<DatasetSummary>,
    pub frame_arrivals: Vec<FrameArrival>,
    pub triggered: Option<SignalSummary>,
    pub prompt: Option<SignalSummary>,
    /// 触发信号的时间分辨偏振（A为平行通道）
    pub polarization: Option<PolarizationTrace>,
    pub profile: Option<NormalizedProfile>,
}

impl TcspcReport {
    /// 触发与即时信号零点之差（bin）
    pub fn zero_shift(&self) -> Option<isize> {
        let t = self.triggered.as_ref()?;
        let p = self.prompt.as_ref()?;
        Some(crate::core::alignment::utils::zero_shift(t.zero_bin, p.zero_bin))
    }
}

/// 处理单个触发帧采集
///
/// 零点取所有帧原始两通道之和（完整长度）按 `triggered_alignment` 定位；
/// 每帧扣除背景后计算平均到达时间，再求和为该采集的直方图。
pub fn analyze_triggered_dataset(
    dataset: &TriggeredDataset,
    config: &AnalysisConfig,
) -> AnalysisResult<(DatasetSummary, Vec<FrameArrival>)> {
    if dataset.frames.is_empty() {
        return Err(AnalysisError::InvalidInput(format!(
            "采集 {} 没有触发帧",
            dataset.label
        )));
    }

    let background = config.select_background(dataset.background.clone());

    let mut raw_sum = vec![0.0; config.total_bins];
    for frame in &dataset.frames {
        if frame.channel_a.len() != config.total_bins {
            return Err(AnalysisError::ShapeMismatch(format!(
                "采集 {} 帧 {} 有 {} 个bin，应为 {}",
                dataset.label,
                frame.frame,
                frame.channel_a.len(),
                config.total_bins
            )));
        }
        for (dst, v) in raw_sum.iter_mut().zip(frame.combined()) {
            *dst += v;
        }
    }
    let zero_bin = config.triggered_alignment.locate(&raw_sum)?;

    let builder = HistogramBuilder::new(config.binning());
    let mut total = DetectorHistogram::zeros(config.active_bins, config.ns_per_bin);
    let mut arrivals = Vec::with_capacity(dataset.frames.len());
    for frame in &dataset.frames {
        let corrected = builder.correct_frame(frame, &background)?;
        let arrival_signal = match config.frame_arrival_window {
            ArrivalWindow::ActiveCorrected => corrected.combined(),
            ArrivalWindow::FullLength => builder.full_length_combined(frame, &background)?,
        };
        arrivals.push(FrameArrival {
            dataset: dataset.label.clone(),
            frame: frame.frame,
            delay_us: config.frame_delay_us(frame.frame),
            mean_arrival_ns: lifetime::mean_arrival_time(
                &arrival_signal,
                zero_bin,
                config.ns_per_bin,
            ),
        });
        total.accumulate(&corrected)?;
    }

    info!(
        dataset = %dataset.label,
        frames = dataset.frames.len(),
        zero_bin,
        policy = config.triggered_alignment.policy_name(),
        "触发帧采集处理完成"
    );

    Ok((
        DatasetSummary {
            label: dataset.label.clone(),
            zero_bin,
            histogram: total,
        },
        arrivals,
    ))
}

/// 求和衰减的零点、平均到达时间与尾部拟合
pub fn summarize_signal(
    kind: SignalKind,
    histogram: DetectorHistogram,
    policy: AlignmentPolicy,
    model: DecayModel,
    config: &AnalysisConfig,
) -> AnalysisResult<SignalSummary> {
    let combined = histogram.combined();
    let zero_bin = policy.locate(&combined)?;
    let mean_arrival_ns = lifetime::mean_arrival_time(&combined, zero_bin, config.ns_per_bin);
    let (times, counts) = config.tail_window().extract(&combined, zero_bin)?;
    let fit = lifetime::tail_fit(
        kind,
        &times,
        &counts,
        model,
        Some(config.guess_for(model)),
        &kind.to_string(),
    )?;

    info!(%kind, zero_bin, mean_arrival_ns, "信号汇总完成");
    Ok(SignalSummary {
        kind,
        histogram,
        zero_bin,
        mean_arrival_ns,
        fit,
    })
}

/// 完整TCSPC分析：触发采集逐一处理后跨日求和，即时信号截取后求和
pub fn analyze_tcspc(
    datasets: &[TriggeredDataset],
    prompts: &[RawFrame],
    config: &AnalysisConfig,
) -> AnalysisResult<TcspcReport> {
    if datasets.is_empty() && prompts.is_empty() {
        return Err(AnalysisError::InvalidInput(
            "没有触发帧采集或即时信号导出".to_string(),
        ));
    }

    let mut summaries = Vec::with_capacity(datasets.len());
    let mut frame_arrivals = Vec::new();
    for dataset in datasets {
        let (summary, arrivals) = analyze_triggered_dataset(dataset, config)?;
        summaries.push(summary);
        frame_arrivals.extend(arrivals);
    }

    let (triggered, polarization, profile) = if summaries.is_empty() {
        (None, None, None)
    } else {
        let normalized: Vec<Vec<f64>> = summaries
            .iter()
            .map(|s| histogram::normalize_to_max(&s.histogram.combined()))
            .collect();
        let (mean, std) = aggregate::trace_statistics(&normalized)?;
        let histograms: Vec<DetectorHistogram> =
            summaries.iter().map(|s| s.histogram.clone()).collect();
        let summed = histogram::sum_histograms(&histograms)?;
        let trace =
            PolarizationTrace::compute(&summed.channel_a, &summed.channel_b, config.g_factor)?;
        let signal = summarize_signal(
            SignalKind::Triggered,
            summed,
            config.summed_triggered_alignment,
            config.triggered_model,
            config,
        )?;
        (
            Some(signal),
            Some(trace),
            Some(NormalizedProfile { mean, std }),
        )
    };

    let prompt = if prompts.is_empty() {
        None
    } else {
        let builder = HistogramBuilder::new(config.binning());
        let truncated = prompts
            .iter()
            .map(|p| builder.truncate_frame(p))
            .collect::<AnalysisResult<Vec<_>>>()?;
        let summed = histogram::sum_histograms(&truncated)?;
        Some(summarize_signal(
            SignalKind::Prompt,
            summed,
            config.prompt_alignment,
            config.prompt_model,
            config,
        )?)
    };

    Ok(TcspcReport {
        datasets: summaries,
        frame_arrivals,
        triggered,
        prompt,
        polarization,
        profile,
    })
}

// ==================== 副本聚合 ====================

/// 聚合结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub summary: Vec<ConditionSummary>,
    pub mixtures: Vec<ReplicateSeries>,
    /// 同组成混合物（多个方案视为副本）的统计
    pub mixture_summary: Vec<ConditionSummary>,
}

/// 按条件统计副本，并按方案构建混合物
pub fn aggregate_records(
    records: &[ReplicateRecord],
    plans: &[MixturePlan],
    order: ChannelOrder,
) -> AnalysisResult<AggregateReport> {
    if records.is_empty() {
        return Err(AnalysisError::InvalidInput("没有副本记录".to_string()));
    }

    let summary = aggregate::summarize(records, order);

    let series = aggregate::series_from_records(records);
    let mixtures = plans
        .iter()
        .map(|plan| plan.apply(&series))
        .collect::<AnalysisResult<Vec<_>>>()?;

    // 同一组成的多个方案编号为不同副本
    let mixture_records: Vec<ReplicateRecord> = mixtures
        .iter()
        .enumerate()
        .flat_map(|(i, mix)| {
            let mut renumbered = mix.clone();
            renumbered.replicate = i as u32;
            renumbered.to_records()
        })
        .collect();
    let mixture_summary = aggregate::summarize(&mixture_records, order);

    info!(
        conditions = summary.len(),
        mixtures = mixtures.len(),
        "副本聚合完成"
    );
    Ok(AggregateReport {
        summary,
        mixtures,
        mixture_summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aggregate::{ConditionKey, Population};
    use crate::core::histogram::BackgroundEntry;
    use crate::core::sampler::EmissionEvent;

    fn small_config() -> AnalysisConfig {
        AnalysisConfig {
            total_bins: 40,
            active_bins: 32,
            trim_bins: 2,
            ns_per_bin: 0.125,
            ..AnalysisConfig::default()
        }
    }

    /// 在 `rise` 处起跳的单指数衰减，外加常数背景
    fn decay_frame(frame: u32, rise: usize, amplitude: f64, bkgd_per_bin: f64) -> RawFrame {
        let signal: Vec<f64> = (0..40)
            .map(|i| {
                let decay = if i >= rise {
                    amplitude * (-0.4 * (i - rise) as f64 * 0.125).exp()
                } else {
                    0.0
                };
                decay + bkgd_per_bin
            })
            .collect();
        RawFrame {
            frame,
            channel_a: signal.clone(),
            channel_b: signal.iter().map(|v| v * 0.5).collect(),
        }
    }

    #[test]
    fn test_count_events_with_stage_plan() {
        let mut log = EventLog::new();
        let signal = SignalDefinition::singlet_emission();
        for t in [1.0, 2.0, 3.0] {
            log.push(&signal, EmissionEvent::new(1.0, 0.0, 0.0, t));
        }
        for t in [11.0, 12.0] {
            log.push(&signal, EmissionEvent::new(0.0, 1.0, 0.0, t));
        }

        let config = AnalysisConfig {
            stages: vec![
                StageWindow {
                    name: "pump".to_string(),
                    since: 0.0,
                    until: Some(5.0),
                },
                StageWindow {
                    name: "probe".to_string(),
                    since: 5.0,
                    until: None,
                },
            ],
            ..AnalysisConfig::default()
        };
        let report = count_events(&log, &signal, &config).unwrap();
        assert_eq!(report.stages[0].counts, ChannelCounts::new(3, 0));
        assert_eq!(report.stages[1].counts, ChannelCounts::new(0, 2));
        assert_eq!(report.totals, ChannelCounts::new(3, 2));
        assert_eq!(report.trace.len(), 2);
        assert_eq!(report.trace[1].time, 12.0);
        assert!((report.steady_state.polarization - 0.2).abs() < 1e-12);

        let missing = count_events(&log, &SignalDefinition::new("T1", "S0"), &config);
        assert!(missing.is_err());
    }

    #[test]
    fn test_time_resolved_histogram() {
        let mut log = EventLog::new();
        let signal = SignalDefinition::singlet_emission();
        for t in [0.1, 0.2, 1.1] {
            log.push(&signal, EmissionEvent::new(1.0, 0.0, 0.0, t));
        }
        log.push(&signal, EmissionEvent::new(0.0, 1.0, 0.0, 1.2));

        let binning = TimeBinning {
            start: 0.0,
            bin_width: 1.0,
            n_bins: 2,
        };
        let report = time_resolved(&log, &signal, binning, &AnalysisConfig::default()).unwrap();
        assert_eq!(report.histogram.channel_a, vec![2.0, 1.0]);
        assert_eq!(report.histogram.channel_b, vec![0.0, 1.0]);
        assert_eq!(report.polarization.polarization[0], 1.0);
        assert_eq!(report.polarization.polarization[1], 0.0);
    }

    #[test]
    fn test_time_resolved_draws_are_reproducible_and_independent() {
        let mut log = EventLog::new();
        let signal = SignalDefinition::singlet_emission();
        let c = (1.0f64 / 3.0).sqrt();
        for i in 0..3000 {
            log.push(&signal, EmissionEvent::new(c, c, c, i as f64 * 0.001));
        }
        let binning = TimeBinning {
            start: 0.0,
            bin_width: 1.0,
            n_bins: 3,
        };
        let config = AnalysisConfig::default();

        let first = time_resolved(&log, &signal, binning, &config).unwrap();
        let second = time_resolved(&log, &signal, binning, &config).unwrap();
        assert_eq!(first.histogram, second.histogram);

        // 与计数管线是两次独立抽样，总数只在统计上接近
        let counts = count_events(&log, &signal, &config).unwrap().totals;
        let binned_x: f64 = first.histogram.channel_a.iter().sum();
        assert!((binned_x - counts.counts_x as f64).abs() < 150.0);
    }

    #[test]
    fn test_triggered_dataset_zero_and_arrivals() {
        let config = small_config();
        let frames = vec![decay_frame(1, 6, 400.0, 1.0), decay_frame(2, 6, 200.0, 1.0)];
        let background = BackgroundTable::new(vec![
            BackgroundEntry {
                frame: 1,
                bkgd_group: 1,
                bkgd_a: 32.0,
                bkgd_b: 16.0,
            },
            BackgroundEntry {
                frame: 2,
                bkgd_group: 1,
                bkgd_a: 32.0,
                bkgd_b: 16.0,
            },
        ]);
        let dataset = TriggeredDataset {
            label: "day1".to_string(),
            frames,
            background,
        };

        let (summary, arrivals) = analyze_triggered_dataset(&dataset, &config).unwrap();
        // 最陡上升沿：bin 5 → 6
        assert_eq!(summary.zero_bin, 5);
        assert_eq!(summary.histogram.len(), 32);
        // 背景完全扣除：起跳前为0
        assert!(summary.histogram.channel_a[..6].iter().all(|v| v.abs() < 1e-9));
        assert_eq!(arrivals.len(), 2);
        assert_eq!(arrivals[1].delay_us, 60.0);
        // 两帧形状相同，平均到达时间一致
        assert!((arrivals[0].mean_arrival_ns - arrivals[1].mean_arrival_ns).abs() < 1e-9);
    }

    #[test]
    fn test_full_length_arrival_window_includes_padding() {
        let frame = decay_frame(1, 6, 400.0, 0.0);
        let dataset = TriggeredDataset {
            label: "day1".to_string(),
            frames: vec![frame.clone()],
            background: BackgroundTable::new(vec![BackgroundEntry {
                frame: 1,
                bkgd_group: 1,
                bkgd_a: 0.0,
                bkgd_b: 0.0,
            }]),
        };
        let raw = frame.combined();

        let active = small_config();
        let (_, arrivals) = analyze_triggered_dataset(&dataset, &active).unwrap();
        let expected = lifetime::mean_arrival_time(&raw[..32], 5, 0.125);
        assert!((arrivals[0].mean_arrival_ns - expected).abs() < 1e-9);

        let full = AnalysisConfig {
            frame_arrival_window: ArrivalWindow::FullLength,
            ..small_config()
        };
        let (_, arrivals_full) = analyze_triggered_dataset(&dataset, &full).unwrap();
        let expected_full = lifetime::mean_arrival_time(&raw, 5, 0.125);
        assert!((arrivals_full[0].mean_arrival_ns - expected_full).abs() < 1e-9);
        // 填充bin中的衰减尾部使平均到达时间后移
        assert!(arrivals_full[0].mean_arrival_ns > arrivals[0].mean_arrival_ns);
    }

    #[test]
    fn test_analyze_tcspc_fits_both_signals() {
        let config = AnalysisConfig {
            triggered_model: DecayModel::Single,
            prompt_model: DecayModel::Single,
            ..small_config()
        };
        let frame = decay_frame(1, 6, 1000.0, 0.0);
        let background = BackgroundTable::new(vec![BackgroundEntry {
            frame: 1,
            bkgd_group: 1,
            bkgd_a: 0.0,
            bkgd_b: 0.0,
        }]);
        let datasets = vec![
            TriggeredDataset {
                label: "day1".to_string(),
                frames: vec![frame.clone()],
                background: background.clone(),
            },
            TriggeredDataset {
                label: "day2".to_string(),
                frames: vec![frame.clone()],
                background,
            },
        ];
        let prompt = decay_frame(0, 4, 800.0, 0.0);

        let report = analyze_tcspc(&datasets, &[prompt], &config).unwrap();
        let triggered = report.triggered.as_ref().unwrap();
        assert_eq!(triggered.zero_bin, 6);
        assert!((triggered.fit.components[0].rate + 0.4).abs() < 1e-6);
        assert_eq!(triggered.histogram.channel_a[6], 2000.0);

        let prompt = report.prompt.as_ref().unwrap();
        assert_eq!(prompt.zero_bin, 4);
        assert_eq!(report.zero_shift(), Some(2));
        assert!(report.polarization.is_some());
        // 两天形状相同：归一化均值峰值为1，标准差为0
        let profile = report.profile.as_ref().unwrap();
        assert_eq!(profile.mean[6], 1.0);
        assert!(profile.std.iter().all(|s| s.abs() < 1e-12));
        assert!(analyze_tcspc(&[], &[], &config).is_err());
    }

    #[test]
    fn test_aggregate_with_mixture_replicates() {
        let record = |pop: f64, rep: u32, x: u64, y: u64| ReplicateRecord {
            key: ConditionKey {
                population: Population::single(pop),
                delay_time_ns: 100.0,
                saturation: None,
            },
            replicate: rep,
            counts: ChannelCounts::new(x, y),
        };
        let records = vec![
            record(450.0, 0, 100, 50),
            record(450.0, 1, 110, 40),
            record(3000.0, 0, 80, 60),
            record(3000.0, 1, 70, 70),
        ];
        let plans: Vec<MixturePlan> = ["450:0+3000:0", "450:1+3000:1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();

        let report = aggregate_records(&records, &plans, ChannelOrder::XMajor).unwrap();
        assert_eq!(report.summary.len(), 2);
        assert_eq!(report.mixtures[0].points[0].1, ChannelCounts::new(180, 110));
        assert_eq!(report.mixture_summary.len(), 1);
        assert_eq!(report.mixture_summary[0].n_replicates, 2);
        assert_eq!(report.mixture_summary[0].mean_x, 180.0);
        assert!(aggregate_records(&[], &[], ChannelOrder::XMajor).is_err());
    }
}
