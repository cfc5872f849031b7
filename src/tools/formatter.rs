//! 输出格式化模块
//!
//! 负责分析结果的文本报告（comfy-table）、扁平CSV表格与JSON输出。

use super::cli::AppConfig;
use super::processor::{AggregateReport, CountReport, TcspcReport, TimeResolvedReport};
use super::table::{CsvWriter, fmt_f64, fmt_opt};
use crate::core::aggregate::{ConditionSummary, ReplicateSeries};
use crate::core::histogram::normalize_to_max;
use crate::core::lifetime::FitResult;
use crate::error::{AnalysisResult, format_error};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 应用程序版本信息
const VERSION: &str = env!("CARGO_PKG_VERSION");

const SEPARATOR: &str =
    "--------------------------------------------------------------------------------\n";

/// 文本报告文件名
pub const REPORT_FILE: &str = "report.txt";

fn new_table(headers: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(headers);
    table
}

fn num(value: f64, precision: usize) -> Cell {
    let text = if value.is_nan() {
        "NaN".to_string()
    } else {
        format!("{value:.precision$}")
    };
    Cell::new(text).set_alignment(CellAlignment::Right)
}

fn int(value: impl ToString) -> Cell {
    Cell::new(value.to_string()).set_alignment(CellAlignment::Right)
}

/// 报告头部（版本、子命令、本地时间）
pub fn create_report_header(title: &str) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "Tumbling Photon Engine v{VERSION} / Polarization Analysis Report\n"
    ));
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    output.push_str(&format!("log date: {now}\n\n"));
    output.push_str(SEPARATOR);
    output.push_str(&format!("{title}\n"));
    output.push_str(SEPARATOR);
    output.push('\n');
    output
}

// ==================== 文本报告 ====================

/// 事件计数报告
pub fn format_count_report(report: &CountReport, resolved: Option<&TimeResolvedReport>) -> String {
    let mut output = String::new();
    output.push_str(&format!("Signal / 信号: {}\n\n", report.signal));

    let mut table = new_table(vec![
        "Stage / 阶段",
        "Since",
        "Until",
        "X",
        "Y",
        "Total / 合计",
    ]);
    for stage in &report.stages {
        table.add_row(vec![
            Cell::new(&stage.name),
            num(stage.since, 3),
            match stage.until {
                Some(until) => num(until, 3),
                None => Cell::new("-").set_alignment(CellAlignment::Right),
            },
            int(stage.counts.counts_x),
            int(stage.counts.counts_y),
            int(stage.counts.total()),
        ]);
    }
    output.push_str(&format!("{table}\n\n"));

    output.push_str(&format!(
        "Totals / 总计:        X = {}, Y = {}\n",
        report.totals.counts_x, report.totals.counts_y
    ));
    output.push_str(&format!(
        "Polarization / 偏振:  {:.4}\n",
        report.steady_state.polarization
    ));
    output.push_str(&format!(
        "Anisotropy / 各向异性: {:.4}\n",
        report.steady_state.anisotropy
    ));

    if let Some(resolved) = resolved {
        output.push('\n');
        output.push_str(&format!(
            "Time-resolved bins / 时间分辨分箱: {} (start {:.3}, width {:.3})\n",
            resolved.histogram.len(),
            resolved.start,
            resolved.histogram.ns_per_bin
        ));
    }
    output
}

fn fit_table(fits: &[&FitResult]) -> Table {
    let mut table = new_table(vec![
        "Signal / 信号",
        "Model / 模型",
        "Term",
        "a",
        "a std",
        "b (1/ns)",
        "b std",
        "tau (ns)",
    ]);
    for fit in fits {
        for (i, c) in fit.components.iter().enumerate() {
            table.add_row(vec![
                Cell::new(fit.signal.to_string()),
                Cell::new(fit.model.to_string()),
                int(i + 1),
                num(c.amplitude, 3),
                num(c.amplitude_std, 3),
                num(c.rate, 5),
                num(c.rate_std, 5),
                num(c.lifetime(), 4),
            ]);
        }
    }
    table
}

/// TCSPC分析报告
pub fn format_tcspc_report(report: &TcspcReport) -> String {
    let mut output = String::new();

    if !report.datasets.is_empty() {
        let mut table = new_table(vec!["Dataset / 采集", "Zero bin / 零点", "Counts / 计数"]);
        for dataset in &report.datasets {
            let counts: f64 = dataset.histogram.combined().iter().sum();
            table.add_row(vec![
                Cell::new(&dataset.label),
                int(dataset.zero_bin),
                num(counts, 0),
            ]);
        }
        output.push_str(&format!("{table}\n\n"));
    }

    let signals: Vec<_> = [report.triggered.as_ref(), report.prompt.as_ref()]
        .into_iter()
        .flatten()
        .collect();
    if !signals.is_empty() {
        let mut table = new_table(vec![
            "Signal / 信号",
            "Zero bin / 零点",
            "Mean arrival (ns) / 平均到达",
            "SSR",
        ]);
        for signal in &signals {
            table.add_row(vec![
                Cell::new(signal.kind.to_string()),
                int(signal.zero_bin),
                num(signal.mean_arrival_ns, 4),
                num(signal.fit.ssr, 3),
            ]);
        }
        output.push_str(&format!("{table}\n\n"));

        let fits: Vec<&FitResult> = signals.iter().map(|s| &s.fit).collect();
        output.push_str(&format!("{}\n\n", fit_table(&fits)));

        for signal in &signals {
            if let Some(tau) = signal.fit.weighted_mean_lifetime {
                output.push_str(&format!(
                    "Weighted mean lifetime / 加权平均寿命 ({}): {tau:.4} ns\n",
                    signal.kind
                ));
            }
        }
    }

    if let Some(shift) = report.zero_shift() {
        output.push_str(&format!("Zero shift / 零点偏移: {shift} bins\n"));
    }
    if !report.frame_arrivals.is_empty() {
        output.push_str(&format!(
            "Frames / 触发帧: {}\n",
            report.frame_arrivals.len()
        ));
    }
    output
}

fn summary_table(summary: &[ConditionSummary]) -> Table {
    let mut table = new_table(vec![
        "Population / 群体",
        "Delay (ns)",
        "Saturation",
        "n",
        "X mean",
        "X std",
        "Y mean",
        "Y std",
        "P mean",
        "P std",
    ]);
    for row in summary {
        table.add_row(vec![
            Cell::new(row.key.population.to_string()),
            num(row.key.delay_time_ns, 1),
            match row.key.saturation {
                Some(s) => num(s, 3),
                None => Cell::new("-").set_alignment(CellAlignment::Right),
            },
            int(row.n_replicates),
            num(row.mean_x, 1),
            num(row.std_x, 1),
            num(row.mean_y, 1),
            num(row.std_y, 1),
            num(row.mean_polarization, 4),
            num(row.std_polarization, 4),
        ]);
    }
    table
}

/// 副本聚合报告
pub fn format_aggregate_report(report: &AggregateReport) -> String {
    let mut output = String::new();
    output.push_str("Condition summary / 条件统计\n");
    output.push_str(&format!("{}\n\n", summary_table(&report.summary)));
    if !report.mixture_summary.is_empty() {
        output.push_str("Mixture summary / 混合物统计\n");
        output.push_str(&format!("{}\n", summary_table(&report.mixture_summary)));
    }
    output
}

// ==================== CSV表格 ====================

/// 事件计数表：阶段计数、累计曲线，以及可选的时间分辨表
pub fn write_count_tables(
    dir: &Path,
    report: &CountReport,
    resolved: Option<&TimeResolvedReport>,
) -> AnalysisResult<Vec<PathBuf>> {
    let mut written = Vec::new();

    let path = dir.join("stage_counts.csv");
    let mut csv = CsvWriter::create(
        &path,
        &["signal", "stage", "since", "until", "counts_x", "counts_y", "total"],
    )?;
    for stage in &report.stages {
        csv.row(&[
            report.signal.to_string(),
            stage.name.clone(),
            fmt_f64(stage.since),
            fmt_opt(stage.until),
            stage.counts.counts_x.to_string(),
            stage.counts.counts_y.to_string(),
            stage.counts.total().to_string(),
        ])?;
    }
    csv.finish()?;
    written.push(path);

    let path = dir.join("count_trace.csv");
    let mut csv = CsvWriter::create(&path, &["time", "counts_x", "counts_y"])?;
    for snapshot in &report.trace {
        csv.row(&[
            fmt_f64(snapshot.time),
            snapshot.counts.counts_x.to_string(),
            snapshot.counts.counts_y.to_string(),
        ])?;
    }
    csv.finish()?;
    written.push(path);

    if let Some(resolved) = resolved {
        let path = dir.join("time_resolved.csv");
        let mut csv = CsvWriter::create(
            &path,
            &["time", "counts_x", "counts_y", "ratio", "anisotropy", "polarization"],
        )?;
        let pol = &resolved.polarization;
        for (i, t) in resolved.histogram.time_axis_ns().iter().enumerate() {
            csv.row(&[
                fmt_f64(resolved.start + t),
                fmt_f64(resolved.histogram.channel_a[i]),
                fmt_f64(resolved.histogram.channel_b[i]),
                fmt_f64(pol.ratio[i]),
                fmt_f64(pol.anisotropy[i]),
                fmt_f64(pol.polarization[i]),
            ])?;
        }
        csv.finish()?;
        written.push(path);
    }

    Ok(written)
}

fn column_or_empty(values: Option<&Vec<f64>>, i: usize) -> String {
    values
        .and_then(|v| v.get(i))
        .map(|v| fmt_f64(*v))
        .unwrap_or_default()
}

fn fit_row(fit: &FitResult) -> Vec<String> {
    let mut row = vec![fit.signal.to_string(), fit.model.to_string()];
    for term in 0..2 {
        match fit.components.get(term) {
            Some(c) => row.extend([
                fmt_f64(c.amplitude),
                fmt_f64(c.rate),
                fmt_f64(c.amplitude_std),
                fmt_f64(c.rate_std),
                fmt_f64(c.lifetime()),
            ]),
            None => row.extend(std::iter::repeat_n(String::new(), 5)),
        }
    }
    row.push(fmt_opt(fit.weighted_mean_lifetime));
    row.push(fmt_f64(fit.ssr));
    row
}

/// TCSPC表格：求和直方图、各采集直方图、逐帧平均到达、拟合参数与残差、偏振曲线
pub fn write_tcspc_tables(dir: &Path, report: &TcspcReport) -> AnalysisResult<Vec<PathBuf>> {
    let mut written = Vec::new();

    let reference = report
        .triggered
        .as_ref()
        .or(report.prompt.as_ref())
        .map(|s| &s.histogram);
    if let Some(reference) = reference {
        let triggered = report.triggered.as_ref().map(|s| &s.histogram);
        let prompt = report.prompt.as_ref().map(|s| &s.histogram);
        let triggered_norm = triggered.map(|h| normalize_to_max(&h.combined()));
        let prompt_norm = prompt.map(|h| normalize_to_max(&h.combined()));

        let path = dir.join("summed_histograms.csv");
        let mut csv = CsvWriter::create(
            &path,
            &[
                "time_ns",
                "triggered_a",
                "triggered_b",
                "triggered_norm",
                "prompt_a",
                "prompt_b",
                "prompt_norm",
                "profile_mean",
                "profile_std",
            ],
        )?;
        let profile = report.profile.as_ref();
        for (i, t) in reference.time_axis_ns().iter().enumerate() {
            csv.row(&[
                fmt_f64(*t),
                column_or_empty(triggered.map(|h| &h.channel_a), i),
                column_or_empty(triggered.map(|h| &h.channel_b), i),
                column_or_empty(triggered_norm.as_ref(), i),
                column_or_empty(prompt.map(|h| &h.channel_a), i),
                column_or_empty(prompt.map(|h| &h.channel_b), i),
                column_or_empty(prompt_norm.as_ref(), i),
                column_or_empty(profile.map(|p| &p.mean), i),
                column_or_empty(profile.map(|p| &p.std), i),
            ])?;
        }
        csv.finish()?;
        written.push(path);
    }

    if !report.datasets.is_empty() {
        let path = dir.join("dataset_histograms.csv");
        let mut csv = CsvWriter::create(&path, &["dataset", "zero_bin", "time_ns", "a", "b"])?;
        for dataset in &report.datasets {
            let h = &dataset.histogram;
            for (i, t) in h.time_axis_ns().iter().enumerate() {
                csv.row(&[
                    dataset.label.clone(),
                    dataset.zero_bin.to_string(),
                    fmt_f64(*t),
                    fmt_f64(h.channel_a[i]),
                    fmt_f64(h.channel_b[i]),
                ])?;
            }
        }
        csv.finish()?;
        written.push(path);
    }

    if !report.frame_arrivals.is_empty() {
        let path = dir.join("frame_arrivals.csv");
        let mut csv =
            CsvWriter::create(&path, &["dataset", "frame", "delay_us", "mean_arrival_ns"])?;
        for arrival in &report.frame_arrivals {
            csv.row(&[
                arrival.dataset.clone(),
                arrival.frame.to_string(),
                fmt_f64(arrival.delay_us),
                fmt_f64(arrival.mean_arrival_ns),
            ])?;
        }
        csv.finish()?;
        written.push(path);
    }

    let fits: Vec<&FitResult> = [report.triggered.as_ref(), report.prompt.as_ref()]
        .into_iter()
        .flatten()
        .map(|s| &s.fit)
        .collect();
    if !fits.is_empty() {
        let path = dir.join("fit_parameters.csv");
        let mut csv = CsvWriter::create(
            &path,
            &[
                "type", "model", "a1", "b1", "a1_std", "b1_std", "tau1", "a2", "b2", "a2_std",
                "b2_std", "tau2", "t_avg", "ssr",
            ],
        )?;
        for fit in &fits {
            csv.row(&fit_row(fit))?;
        }
        csv.finish()?;
        written.push(path);

        let path = dir.join("fit_residuals.csv");
        let mut csv = CsvWriter::create(&path, &["type", "time_ns", "residual"])?;
        for fit in &fits {
            for (t, r) in fit.times.iter().zip(&fit.residuals) {
                csv.row(&[fit.signal.to_string(), fmt_f64(*t), fmt_f64(*r)])?;
            }
        }
        csv.finish()?;
        written.push(path);
    }

    if let (Some(pol), Some(reference)) = (&report.polarization, reference) {
        let path = dir.join("polarization_trace.csv");
        let mut csv = CsvWriter::create(
            &path,
            &["time_ns", "ratio", "anisotropy", "polarization"],
        )?;
        for (i, t) in reference.time_axis_ns().iter().enumerate().take(pol.ratio.len()) {
            csv.row(&[
                fmt_f64(*t),
                fmt_f64(pol.ratio[i]),
                fmt_f64(pol.anisotropy[i]),
                fmt_f64(pol.polarization[i]),
            ])?;
        }
        csv.finish()?;
        written.push(path);
    }

    Ok(written)
}

fn write_summary(path: &Path, summary: &[ConditionSummary]) -> AnalysisResult<()> {
    let mut csv = CsvWriter::create(
        path,
        &[
            "population",
            "delay_time_ns",
            "saturation",
            "n_replicates",
            "mean_x",
            "std_x",
            "mean_y",
            "std_y",
            "mean_polarization",
            "std_polarization",
        ],
    )?;
    for row in summary {
        csv.row(&[
            row.key.population.to_string(),
            fmt_f64(row.key.delay_time_ns),
            fmt_opt(row.key.saturation),
            row.n_replicates.to_string(),
            fmt_f64(row.mean_x),
            fmt_f64(row.std_x),
            fmt_f64(row.mean_y),
            fmt_f64(row.std_y),
            fmt_f64(row.mean_polarization),
            fmt_f64(row.std_polarization),
        ])?;
    }
    csv.finish()
}

fn write_mixtures(path: &Path, mixtures: &[ReplicateSeries]) -> AnalysisResult<()> {
    let mut csv = CsvWriter::create(
        path,
        &[
            "plan",
            "population",
            "saturation",
            "delay_time_ns",
            "counts_x",
            "counts_y",
        ],
    )?;
    for (plan, mix) in mixtures.iter().enumerate() {
        for (delay, counts) in &mix.points {
            csv.row(&[
                plan.to_string(),
                mix.population.to_string(),
                fmt_opt(mix.saturation),
                fmt_f64(*delay),
                counts.counts_x.to_string(),
                counts.counts_y.to_string(),
            ])?;
        }
    }
    csv.finish()
}

/// 聚合表格：条件统计、混合物计数与混合物统计
pub fn write_aggregate_tables(dir: &Path, report: &AggregateReport) -> AnalysisResult<Vec<PathBuf>> {
    let mut written = Vec::new();

    let path = dir.join("condition_summary.csv");
    write_summary(&path, &report.summary)?;
    written.push(path);

    if !report.mixtures.is_empty() {
        let path = dir.join("mixtures.csv");
        write_mixtures(&path, &report.mixtures)?;
        written.push(path);

        let path = dir.join("mixture_summary.csv");
        write_summary(&path, &report.mixture_summary)?;
        written.push(path);
    }
    Ok(written)
}

// ==================== 输出 ====================

/// 序列化为格式化JSON
pub fn to_json<T: Serialize>(value: &T) -> AnalysisResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| format_error("JSON序列化失败", e))
}

/// 处理输出写入（控制台，以及输出目录中的文本报告）
pub fn write_output(output: &str, config: &AppConfig) -> AnalysisResult<()> {
    print!("{output}");
    if let Some(dir) = &config.output_dir {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        std::fs::write(&path, output)?;
        println!("[OK] 报告已保存到 / Report saved: {}", path.display());
    }
    Ok(())
}

/// 打印已写出的表格路径
pub fn show_written_tables(paths: &[PathBuf]) {
    for path in paths {
        println!("[OK] 表格已写出 / Table written: {}", path.display());
    }
}
