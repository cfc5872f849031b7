//! 命令行接口模块
//!
//! 负责命令行参数解析、配置覆盖和程序信息展示。

use super::config::{AnalysisConfig, ArrivalWindow, StageWindow};
use super::constants::parallel_limits;
use super::processor::TimeBinning;
use crate::core::aggregate::{ChannelOrder, MixturePlan};
use crate::core::alignment::AlignmentPolicy;
use crate::core::lifetime::DecayModel;
use crate::error::{AnalysisError, AnalysisResult};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// 应用程序版本信息
const VERSION: &str = env!("CARGO_PKG_VERSION");
const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// 子命令及其输入
#[derive(Debug, Clone)]
pub enum Mode {
    /// 事件表 → 分阶段通道计数
    Count {
        events: PathBuf,
        initial_state: Option<String>,
        final_state: Option<String>,
        time_bins: Option<TimeBinning>,
    },
    /// 触发帧导出 + 背景表（+ 即时信号导出）→ 衰减分析
    Tcspc {
        triggered: Vec<PathBuf>,
        backgrounds: Vec<PathBuf>,
        prompts: Vec<PathBuf>,
    },
    /// 副本表或目录 → 条件统计与混合物
    Aggregate {
        input: PathBuf,
        mixes: Vec<MixturePlan>,
    },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count { .. } => "count",
            Self::Tcspc { .. } => "tcspc",
            Self::Aggregate { .. } => "aggregate",
        }
    }
}

/// 命令行对分析配置的单项覆盖
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub seed: Option<u64>,
    pub no_clip: bool,
    pub g_factor: Option<f64>,
    pub frame_period_us: Option<f64>,
    pub background_groups: Option<Vec<u32>>,
    pub channel_order: Option<ChannelOrder>,
    pub triggered_alignment: Option<AlignmentPolicy>,
    pub prompt_alignment: Option<AlignmentPolicy>,
    pub arrival_window: Option<ArrivalWindow>,
    pub triggered_model: Option<DecayModel>,
    pub prompt_model: Option<DecayModel>,
    pub since: Option<f64>,
}

impl ConfigOverrides {
    /// 覆盖到配置上
    pub fn apply(&self, config: &mut AnalysisConfig) {
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.no_clip {
            config.clip_negative = false;
        }
        if let Some(g) = self.g_factor {
            config.g_factor = g;
        }
        if let Some(period) = self.frame_period_us {
            config.frame_period_us = period;
        }
        if let Some(groups) = &self.background_groups {
            config.background_groups = groups.clone();
        }
        if let Some(order) = self.channel_order {
            config.channel_order = order;
        }
        if let Some(policy) = self.triggered_alignment {
            config.triggered_alignment = policy;
        }
        if let Some(policy) = self.prompt_alignment {
            config.prompt_alignment = policy;
        }
        if let Some(window) = self.arrival_window {
            config.frame_arrival_window = window;
        }
        if let Some(model) = self.triggered_model {
            config.triggered_model = model;
        }
        if let Some(model) = self.prompt_model {
            config.prompt_model = model;
        }
        if let Some(since) = self.since {
            config.stages = vec![StageWindow {
                name: format!("after_{since}"),
                since,
                until: None,
            }];
        }
    }
}

/// 应用程序配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: Mode,

    /// JSON分析配置文件
    pub config_path: Option<PathBuf>,

    pub overrides: ConfigOverrides,

    /// 输出目录（缺省时只打印报告）
    pub output_dir: Option<PathBuf>,

    /// 以JSON打印结果
    pub json: bool,

    /// 详细级别（-v 次数）
    pub verbosity: u8,

    /// 目录模式的并发度（None 表示串行）
    pub parallel_files: Option<usize>,
}

impl AppConfig {
    #[inline]
    pub fn verbose(&self) -> bool {
        self.verbosity > 0
    }

    /// 读取配置文件（若有）并应用命令行覆盖
    pub fn analysis_config(&self) -> AnalysisResult<AnalysisConfig> {
        let mut config = match &self.config_path {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        self.overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

fn common_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("config")
            .long("config")
            .short('c')
            .help("JSON分析配置文件")
            .value_name("FILE"),
    )
    .arg(
        Arg::new("output")
            .long("output")
            .short('o')
            .help("输出目录（写入CSV表格与文本报告）")
            .value_name("DIR"),
    )
    .arg(
        Arg::new("json")
            .long("json")
            .help("以JSON格式打印结果")
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("verbose")
            .long("verbose")
            .short('v')
            .help("显示详细处理信息（可重复：-vv）")
            .action(ArgAction::Count),
    )
}

/// 构建命令定义
pub fn build_command() -> Command {
    Command::new("tumbling-engine")
        .version(VERSION)
        .about(DESCRIPTION)
        .author("Tumbling Analysis Team")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(common_args(
            Command::new("count")
                .about("按阶段累加发射事件的偏振通道计数")
                .arg(
                    Arg::new("EVENTS")
                        .help("发射事件表 (x, y, z, t[, initial_state, final_state])")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("initial-state")
                        .long("initial-state")
                        .help("信号初态（缺省为单重激发态）")
                        .value_name("STATE"),
                )
                .arg(
                    Arg::new("final-state")
                        .long("final-state")
                        .help("信号末态（缺省为基态）")
                        .value_name("STATE"),
                )
                .arg(
                    Arg::new("since")
                        .long("since")
                        .help("只统计 t > SINCE 的事件（替换配置中的阶段计划）")
                        .value_name("SINCE")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .help("随机种子")
                        .value_name("SEED")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("time-bins")
                        .long("time-bins")
                        .help("事件时间直方图: START:WIDTH:BINS")
                        .value_name("SPEC"),
                ),
        ))
        .subcommand(common_args(
            Command::new("tcspc")
                .about("背景扣除、零点对齐、平均到达时间与尾部拟合")
                .arg(
                    Arg::new("triggered")
                        .long("triggered")
                        .short('t')
                        .help("触发帧TCSPC导出（可重复，每个对应一个 --background）")
                        .value_name("FILE")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("background")
                        .long("background")
                        .short('b')
                        .help("背景表（与 --triggered 按顺序配对）")
                        .value_name("FILE")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("prompt")
                        .long("prompt")
                        .short('p')
                        .help("即时信号TCSPC导出（可重复，逐日求和）")
                        .value_name("FILE")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("bkgd-groups")
                        .long("bkgd-groups")
                        .help("只使用这些背景组，如 7,8")
                        .value_name("LIST"),
                )
                .arg(
                    Arg::new("no-clip")
                        .long("no-clip")
                        .help("背景扣除后保留负值")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("frame-period")
                        .long("frame-period")
                        .help("触发帧间隔（微秒）")
                        .value_name("US")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("g-factor")
                        .long("g-factor")
                        .help("垂直通道g因子")
                        .value_name("G")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("triggered-alignment")
                        .long("triggered-alignment")
                        .help("触发信号零点策略")
                        .value_parser(["max-rising-edge", "max-value"]),
                )
                .arg(
                    Arg::new("prompt-alignment")
                        .long("prompt-alignment")
                        .help("即时信号零点策略")
                        .value_parser(["max-rising-edge", "max-value"]),
                )
                .arg(
                    Arg::new("arrival-window")
                        .long("arrival-window")
                        .help("逐帧平均到达时间范围：有效bin（截断）或完整长度（不截断）")
                        .value_parser(["active", "full-length"]),
                )
                .arg(
                    Arg::new("triggered-model")
                        .long("triggered-model")
                        .help("触发信号衰减模型")
                        .value_parser(["single", "double"]),
                )
                .arg(
                    Arg::new("prompt-model")
                        .long("prompt-model")
                        .help("即时信号衰减模型")
                        .value_parser(["single", "double"]),
                ),
        ))
        .subcommand(common_args(
            Command::new("aggregate")
                .about("副本均值/标准差与混合物")
                .arg(
                    Arg::new("INPUT")
                        .help("副本计数表或包含多个表的目录")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("mix")
                        .long("mix")
                        .short('m')
                        .help("混合方案 POP:REP+POP:REP（可重复）")
                        .value_name("PLAN")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("channel-order")
                        .long("channel-order")
                        .help("偏振主通道")
                        .value_parser(["x", "y"]),
                )
                .arg(
                    Arg::new("parallel-files")
                        .long("parallel-files")
                        .help("目录模式并发度")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("serial")
                        .long("serial")
                        .help("目录模式串行处理")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("parallel-files"),
                ),
        ))
}

fn paths(matches: &ArgMatches, id: &str) -> Vec<PathBuf> {
    matches
        .get_many::<String>(id)
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn required_path(matches: &ArgMatches, id: &str) -> AnalysisResult<PathBuf> {
    matches
        .get_one::<String>(id)
        .map(PathBuf::from)
        .ok_or_else(|| AnalysisError::InvalidInput(format!("缺少参数 {id}")))
}

fn parse_alignment(value: &str) -> AlignmentPolicy {
    match value {
        "max-value" => AlignmentPolicy::MaxValue,
        _ => AlignmentPolicy::MaxRisingEdge,
    }
}

fn parse_model(value: &str) -> DecayModel {
    match value {
        "double" => DecayModel::Double,
        _ => DecayModel::Single,
    }
}

/// 解析 `START:WIDTH:BINS`
pub fn parse_time_bins(spec: &str) -> AnalysisResult<TimeBinning> {
    let parts: Vec<&str> = spec.split(':').collect();
    let invalid = || {
        AnalysisError::InvalidInput(format!("时间分箱应为 START:WIDTH:BINS，实际 '{spec}'"))
    };
    if parts.len() != 3 {
        return Err(invalid());
    }
    Ok(TimeBinning {
        start: parts[0].parse().map_err(|_| invalid())?,
        bin_width: parts[1].parse().map_err(|_| invalid())?,
        n_bins: parts[2].parse().map_err(|_| invalid())?,
    })
}

/// 解析逗号分隔的背景组列表
pub fn parse_groups(list: &str) -> AnalysisResult<Vec<u32>> {
    list.split(',')
        .map(|g| {
            g.trim()
                .parse::<u32>()
                .map_err(|_| AnalysisError::InvalidInput(format!("无法解析背景组 '{g}'")))
        })
        .collect()
}

/// 从已匹配的参数构建配置（便于测试）
pub fn config_from_matches(matches: &ArgMatches) -> AnalysisResult<AppConfig> {
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| AnalysisError::InvalidInput("缺少子命令".to_string()))?;

    let mut overrides = ConfigOverrides::default();
    let mut parallel_files = None;

    let mode = match name {
        "count" => {
            overrides.seed = sub.get_one::<u64>("seed").copied();
            overrides.since = sub.get_one::<f64>("since").copied();
            Mode::Count {
                events: required_path(sub, "EVENTS")?,
                initial_state: sub.get_one::<String>("initial-state").cloned(),
                final_state: sub.get_one::<String>("final-state").cloned(),
                time_bins: sub
                    .get_one::<String>("time-bins")
                    .map(|s| parse_time_bins(s))
                    .transpose()?,
            }
        }
        "tcspc" => {
            overrides.no_clip = sub.get_flag("no-clip");
            overrides.frame_period_us = sub.get_one::<f64>("frame-period").copied();
            overrides.g_factor = sub.get_one::<f64>("g-factor").copied();
            overrides.background_groups = sub
                .get_one::<String>("bkgd-groups")
                .map(|s| parse_groups(s))
                .transpose()?;
            overrides.triggered_alignment = sub
                .get_one::<String>("triggered-alignment")
                .map(|s| parse_alignment(s));
            overrides.prompt_alignment = sub
                .get_one::<String>("prompt-alignment")
                .map(|s| parse_alignment(s));
            overrides.arrival_window = sub
                .get_one::<String>("arrival-window")
                .map(|s| match s.as_str() {
                    "full-length" => ArrivalWindow::FullLength,
                    _ => ArrivalWindow::ActiveCorrected,
                });
            overrides.triggered_model = sub
                .get_one::<String>("triggered-model")
                .map(|s| parse_model(s));
            overrides.prompt_model = sub.get_one::<String>("prompt-model").map(|s| parse_model(s));

            let triggered = paths(sub, "triggered");
            let backgrounds = paths(sub, "background");
            if triggered.len() != backgrounds.len() {
                return Err(AnalysisError::InvalidInput(format!(
                    "--triggered ({}) 与 --background ({}) 数量必须一致",
                    triggered.len(),
                    backgrounds.len()
                )));
            }
            Mode::Tcspc {
                triggered,
                backgrounds,
                prompts: paths(sub, "prompt"),
            }
        }
        "aggregate" => {
            overrides.channel_order = sub.get_one::<String>("channel-order").map(|s| {
                if s == "y" {
                    ChannelOrder::YMajor
                } else {
                    ChannelOrder::XMajor
                }
            });
            if !sub.get_flag("serial") {
                let degree = sub
                    .get_one::<usize>("parallel-files")
                    .copied()
                    .unwrap_or(super::constants::defaults::PARALLEL_FILES_DEGREE);
                parallel_files = Some(degree.clamp(
                    parallel_limits::MIN_PARALLEL_DEGREE,
                    parallel_limits::MAX_PARALLEL_DEGREE,
                ));
            }
            let mixes = sub
                .get_many::<String>("mix")
                .map(|values| {
                    values
                        .map(|v| v.parse::<MixturePlan>())
                        .collect::<AnalysisResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Mode::Aggregate {
                input: required_path(sub, "INPUT")?,
                mixes,
            }
        }
        other => {
            return Err(AnalysisError::InvalidInput(format!("未知子命令: {other}")));
        }
    };

    Ok(AppConfig {
        mode,
        config_path: sub.get_one::<String>("config").map(PathBuf::from),
        overrides,
        output_dir: sub.get_one::<String>("output").map(PathBuf::from),
        json: sub.get_flag("json"),
        verbosity: sub.get_count("verbose"),
        parallel_files,
    })
}

/// 解析命令行参数并创建配置
pub fn parse_args() -> AnalysisResult<AppConfig> {
    config_from_matches(&build_command().get_matches())
}

/// 显示程序启动信息
pub fn show_startup_info(config: &AppConfig) {
    println!("[INFO] Tumbling Photon Engine v{VERSION} 启动 / started");
    if config.verbose() {
        println!("[INFO] {DESCRIPTION}");
        println!("[INFO] 子命令 / Subcommand: {}", config.mode.name());
    }
}

/// 显示程序完成信息
pub fn show_completion_info(config: &AppConfig) {
    if config.verbose() {
        println!("[OK] 所有任务处理完成 / All tasks completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AnalysisResult<AppConfig> {
        let matches = build_command()
            .try_get_matches_from(args)
            .expect("arguments should parse");
        config_from_matches(&matches)
    }

    #[test]
    fn test_count_subcommand() {
        let config = parse(&[
            "tumbling-engine",
            "count",
            "events.csv",
            "--since",
            "50",
            "--seed",
            "7",
            "--time-bins",
            "0:0.5:20",
            "-vv",
        ])
        .unwrap();
        assert_eq!(config.verbosity, 2);
        match &config.mode {
            Mode::Count {
                events, time_bins, ..
            } => {
                assert_eq!(events, &PathBuf::from("events.csv"));
                assert_eq!(time_bins.unwrap().n_bins, 20);
            }
            other => panic!("unexpected mode {other:?}"),
        }

        let analysis = config.analysis_config().unwrap();
        assert_eq!(analysis.seed, 7);
        assert_eq!(analysis.stages.len(), 1);
        assert_eq!(analysis.stages[0].since, 50.0);
    }

    #[test]
    fn test_tcspc_pairs_and_overrides() {
        let config = parse(&[
            "tumbling-engine",
            "tcspc",
            "-t",
            "a.csv",
            "-b",
            "bkgd_a.csv",
            "-t",
            "b.csv",
            "-b",
            "bkgd_b.csv",
            "--bkgd-groups",
            "7,8",
            "--no-clip",
            "--triggered-alignment",
            "max-value",
            "--arrival-window",
            "full-length",
        ])
        .unwrap();
        let analysis = config.analysis_config().unwrap();
        assert_eq!(analysis.background_groups, vec![7, 8]);
        assert!(!analysis.clip_negative);
        assert_eq!(analysis.triggered_alignment, AlignmentPolicy::MaxValue);
        assert_eq!(analysis.frame_arrival_window, ArrivalWindow::FullLength);

        let unpaired = parse(&["tumbling-engine", "tcspc", "-t", "a.csv"]);
        assert!(matches!(unpaired, Err(AnalysisError::InvalidInput(_))));
    }

    #[test]
    fn test_aggregate_parallel_and_mixes() {
        let config = parse(&[
            "tumbling-engine",
            "aggregate",
            "tables/",
            "--mix",
            "450:0+3000:0",
            "--parallel-files",
            "64",
        ])
        .unwrap();
        assert_eq!(config.parallel_files, Some(parallel_limits::MAX_PARALLEL_DEGREE));
        match &config.mode {
            Mode::Aggregate { mixes, .. } => assert_eq!(mixes.len(), 1),
            other => panic!("unexpected mode {other:?}"),
        }

        let serial = parse(&["tumbling-engine", "aggregate", "t.csv", "--serial"]).unwrap();
        assert_eq!(serial.parallel_files, None);

        assert!(parse(&["tumbling-engine", "aggregate", "t.csv", "--mix", "450"]).is_err());
    }

    #[test]
    fn test_time_bins_and_groups_parsing() {
        assert!(parse_time_bins("0:1").is_err());
        assert_eq!(parse_time_bins("1:0.5:4").unwrap().start, 1.0);
        assert_eq!(parse_groups("1, 2").unwrap(), vec![1, 2]);
        assert!(parse_groups("a").is_err());
    }
}
