//! Tumbling Photon Engine - 主程序入口
//!
//! 纯流程控制器，负责协调各个工具模块完成计数、TCSPC与聚合分析任务。

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use tumbling_photon_engine::{
    core::{MixturePlan, SignalDefinition},
    error::{AnalysisError, ErrorCategory},
    tools::{self, AnalysisConfig, AppConfig, Mode, TimeBinning},
};

/// 错误退出码定义
mod exit_codes {
    /// 通用错误（含I/O）
    pub const GENERAL_ERROR: i32 = 1;
    /// 输入/表格格式错误
    pub const INPUT_ERROR: i32 = 2;
    /// 背景或帧查找失败
    pub const LOOKUP_ERROR: i32 = 3;
    /// 计算/拟合错误
    pub const CALCULATION_ERROR: i32 = 4;
    /// 时间轴或bin数不一致
    pub const SHAPE_ERROR: i32 = 5;
}

/// 获取错误建议文本
fn get_error_suggestion(error: &AnalysisError) -> &'static str {
    match error {
        AnalysisError::InvalidInput(_) => {
            "检查命令行参数是否正确，使用 --help 查看完整用法 / Check if command-line arguments are correct, use --help to see full usage"
        }
        AnalysisError::FitConvergence { .. } => {
            "拟合未收敛，尝试调整配置中的初值或改用单指数模型 / Fit did not converge, adjust initial guesses in the config or use the single-exponential model"
        }
        _ => match ErrorCategory::from_analysis_error(error) {
            ErrorCategory::Io => {
                "检查文件路径是否正确，文件是否存在且可读 / Check if file path is correct, file exists and is readable"
            }
            ErrorCategory::Input => {
                "确保输入表格包含所需列且数值可解析 / Ensure input tables contain the required columns and parseable values"
            }
            ErrorCategory::Lookup => {
                "背景表需为每个触发帧提供唯一条目，检查 --bkgd-groups 与排除规则 / The background table needs exactly one entry per trigger frame, check --bkgd-groups and exclusions"
            }
            ErrorCategory::Shape => {
                "各输入的bin数或延迟时间轴不一致 / Inputs disagree on bin count or delay axis"
            }
            ErrorCategory::Calculation => {
                "计算过程出现异常，请检查输入是否包含有效计数 / Calculation error occurred, check that inputs contain valid counts"
            }
        },
    }
}

/// 错误处理和建议
fn handle_error(error: anyhow::Error) -> ! {
    eprintln!("[ERROR] 错误 / Error: {error:#}");

    let Some(analysis_error) = error.downcast_ref::<AnalysisError>() else {
        process::exit(exit_codes::GENERAL_ERROR);
    };

    eprintln!(
        "[INFO] 建议 / Suggestion: {}",
        get_error_suggestion(analysis_error)
    );

    let exit_code = match ErrorCategory::from_analysis_error(analysis_error) {
        ErrorCategory::Input => exit_codes::INPUT_ERROR,
        ErrorCategory::Lookup => exit_codes::LOOKUP_ERROR,
        ErrorCategory::Calculation => exit_codes::CALCULATION_ERROR,
        ErrorCategory::Shape => exit_codes::SHAPE_ERROR,
        ErrorCategory::Io => exit_codes::GENERAL_ERROR,
    };

    process::exit(exit_code);
}

/// 安装日志订阅器（默认warn，-v info，-vv debug，RUST_LOG优先）
fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 打印报告或JSON，并在输出目录写表格
fn emit<T: serde::Serialize>(
    config: &AppConfig,
    title: &str,
    text: String,
    value: &T,
    write_tables: impl FnOnce(&Path) -> tumbling_photon_engine::AnalysisResult<Vec<PathBuf>>,
) -> anyhow::Result<()> {
    if config.json {
        println!("{}", tools::to_json(value)?);
    } else {
        let mut output = tools::create_report_header(title);
        output.push_str(&text);
        tools::write_output(&output, config)?;
    }

    if let Some(dir) = &config.output_dir {
        tools::utils::ensure_dir(dir)?;
        let written = write_tables(dir)?;
        tools::formatter::show_written_tables(&written);
    }
    Ok(())
}

/// 事件计数模式
fn process_count_mode(
    config: &AppConfig,
    analysis: &AnalysisConfig,
    events: &Path,
    initial_state: Option<&str>,
    final_state: Option<&str>,
    time_bins: Option<TimeBinning>,
) -> anyhow::Result<()> {
    let log = tools::table::read_events(events)
        .with_context(|| format!("读取事件表失败 / Failed to read events: {}", events.display()))?;

    let default_signal = SignalDefinition::singlet_emission();
    let signal = SignalDefinition::new(
        initial_state.unwrap_or(default_signal.initial_state.as_str()),
        final_state.unwrap_or(default_signal.final_state.as_str()),
    );

    if config.verbose() {
        println!(
            "[INFO] 读取 {} 个事件，信号: {} / events loaded",
            log.len(),
            signal
        );
    }

    let report = tools::count_events(&log, &signal, analysis)?;
    let resolved = time_bins
        .map(|binning| tools::time_resolved(&log, &signal, binning, analysis))
        .transpose()?;

    let text = tools::format_count_report(&report, resolved.as_ref());
    emit(
        config,
        "count",
        text,
        &serde_json::json!({ "counts": &report, "time_resolved": &resolved }),
        |dir| tools::write_count_tables(dir, &report, resolved.as_ref()),
    )
}

/// TCSPC分析模式
fn process_tcspc_mode(
    config: &AppConfig,
    analysis: &AnalysisConfig,
    triggered: &[PathBuf],
    backgrounds: &[PathBuf],
    prompts: &[PathBuf],
) -> anyhow::Result<()> {
    let mut datasets = Vec::with_capacity(triggered.len());
    for (index, (frames_path, bkgd_path)) in triggered.iter().zip(backgrounds).enumerate() {
        if config.verbose() {
            println!(
                "[PROCESSING] [{}/{}] 读取 / Reading: {}",
                index + 1,
                triggered.len(),
                tools::utils::extract_filename_lossy(frames_path)
            );
        }
        let frames = tools::table::read_trigger_frames(frames_path, analysis.total_bins)
            .with_context(|| format!("读取触发帧导出失败: {}", frames_path.display()))?;
        let background = tools::table::read_background(bkgd_path)
            .with_context(|| format!("读取背景表失败: {}", bkgd_path.display()))?;
        datasets.push(tools::TriggeredDataset {
            label: tools::utils::extract_file_stem(frames_path).to_string(),
            frames,
            background,
        });
    }

    let prompt_frames = prompts
        .iter()
        .map(|path| {
            tools::table::read_prompt(path)
                .with_context(|| format!("读取即时信号导出失败: {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let report = tools::analyze_tcspc(&datasets, &prompt_frames, analysis)?;
    let text = tools::format_tcspc_report(&report);
    emit(config, "tcspc", text, &report, |dir| {
        tools::write_tcspc_tables(dir, &report)
    })
}

/// 副本聚合模式（目录输入时批量加载）
fn process_aggregate_mode(
    config: &AppConfig,
    analysis: &AnalysisConfig,
    input: &Path,
    mixes: &[MixturePlan],
) -> anyhow::Result<()> {
    let files = tools::resolve_inputs(input)?;
    let is_batch = input.is_dir();
    if is_batch {
        tools::show_scan_results(input, &files, config.verbose());
        if files.is_empty() {
            return Ok(());
        }
    }

    let load = match config.parallel_files {
        Some(degree) if is_batch => {
            let actual_degree = tools::utils::effective_parallel_degree(degree, Some(files.len()));
            if actual_degree == 1 {
                if config.verbose() {
                    println!("[INFO] 并发度为1，使用串行模式 / Parallelism=1, using serial mode");
                }
                tools::load_replicates_serial(&files, config.verbose())
            } else {
                tools::load_replicates_parallel(&files, actual_degree, config.verbose())
                    .unwrap_or_else(|e| {
                        eprintln!("[WARNING] 并行加载失败 / Parallel loading failed: {e}，回退到串行模式 / fallback to serial");
                        tools::load_replicates_serial(&files, config.verbose())
                    })
            }
        }
        _ => tools::load_replicates_serial(&files, config.verbose()),
    };

    if is_batch {
        print!(
            "{}",
            tools::create_batch_footer(files.len(), load.processed, load.failed)
        );
    }
    let records = load.into_records()?;

    let report = tools::aggregate_records(&records, mixes, analysis.channel_order)?;
    let text = tools::format_aggregate_report(&report);
    emit(config, "aggregate", text, &report, |dir| {
        tools::write_aggregate_tables(dir, &report)
    })
}

/// 应用程序主逻辑（便于测试和复用）
fn run(config: &AppConfig) -> anyhow::Result<()> {
    tools::show_startup_info(config);

    let analysis = config.analysis_config().with_context(|| {
        match &config.config_path {
            Some(path) => format!("加载分析配置失败 / Failed to load config: {}", path.display()),
            None => "分析配置无效 / Invalid analysis config".to_string(),
        }
    })?;

    match &config.mode {
        Mode::Count {
            events,
            initial_state,
            final_state,
            time_bins,
        } => process_count_mode(
            config,
            &analysis,
            events,
            initial_state.as_deref(),
            final_state.as_deref(),
            *time_bins,
        )?,
        Mode::Tcspc {
            triggered,
            backgrounds,
            prompts,
        } => process_tcspc_mode(config, &analysis, triggered, backgrounds, prompts)?,
        Mode::Aggregate { input, mixes } => {
            process_aggregate_mode(config, &analysis, input, mixes)?
        }
    }

    tools::show_completion_info(config);
    Ok(())
}

fn main() {
    // 解析命令行参数
    let config = match tools::parse_args() {
        Ok(config) => config,
        Err(error) => handle_error(error.into()),
    };

    init_tracing(config.verbosity);

    if let Err(error) = run(&config) {
        handle_error(error);
    }
}
