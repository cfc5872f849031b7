//! 管线集成测试
//!
//! 从磁盘表格出发驱动三条分析管线（计数、TCSPC、聚合），
//! 验证表格读取、分析结果与CSV输出的端到端一致性。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tumbling_photon_engine::core::{ChannelCounts, MixturePlan, SignalDefinition};
use tumbling_photon_engine::error::AnalysisError;
use tumbling_photon_engine::tools::{self, AnalysisConfig, TriggeredDataset, table};
use tumbling_photon_engine::{DecayModel, core::ChannelOrder};

fn log(msg_zh: impl AsRef<str>, msg_en: impl AsRef<str>) {
    println!("{} / {}", msg_zh.as_ref(), msg_en.as_ref());
}

/// 每个测试独立的临时目录
fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tumbling_it_{name}_{}",
        std::process::id()
    ));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
}

/// 球面均匀取向的发射事件表
fn write_isotropic_events(path: &Path, n: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut csv = String::from(",x,y,z,t\n");
    for i in 0..n {
        let z: f64 = 2.0 * rng.random::<f64>() - 1.0;
        let phi: f64 = 2.0 * std::f64::consts::PI * rng.random::<f64>();
        let r = (1.0 - z * z).sqrt();
        csv.push_str(&format!(
            "{i},{},{},{z},{}\n",
            r * phi.cos(),
            r * phi.sin(),
            i as f64 * 0.01
        ));
    }
    write(path, &csv);
}

// ========== 事件计数 ==========

#[test]
fn test_count_pipeline_isotropic_fraction() {
    log("各向同性取向计数", "Isotropic orientation counting");
    let dir = temp_dir("count");
    let events = dir.join("events.csv");
    write_isotropic_events(&events, 20_000, 7);

    let event_log = table::read_events(&events).unwrap();
    assert_eq!(event_log.len(), 20_000);

    let config = AnalysisConfig {
        seed: 11,
        ..AnalysisConfig::default()
    };
    let signal = SignalDefinition::singlet_emission();
    let report = tools::count_events(&event_log, &signal, &config).unwrap();
    let fraction_x = report.totals.counts_x as f64 / 20_000.0;
    let fraction_y = report.totals.counts_y as f64 / 20_000.0;
    log(
        format!("X比例 {fraction_x:.4}, Y比例 {fraction_y:.4}"),
        "fractions",
    );
    assert!((fraction_x - 1.0 / 3.0).abs() < 0.02);
    assert!((fraction_y - 1.0 / 3.0).abs() < 0.02);

    // 相同种子结果完全一致
    let again = tools::count_events(&event_log, &signal, &config).unwrap();
    assert_eq!(report.totals, again.totals);

    let written = tools::write_count_tables(&dir, &report, None).unwrap();
    assert!(written.iter().all(|p| p.exists()));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_count_pipeline_stage_plan_no_double_count() {
    log("阶段计划不重复计数", "Stage plan never double counts");
    let dir = temp_dir("stages");
    let events = dir.join("events.csv");
    // 全部沿X：计数等于窗口内事件数
    let mut csv = String::from("x,y,z,t,initial_state,final_state\n");
    for i in 0..10 {
        csv.push_str(&format!("1,0,0,{},S1,S0\n", i as f64));
    }
    csv.push_str("0,1,0,3.5,T1,S0\n");
    write(&events, &csv);

    let event_log = table::read_events(&events).unwrap();
    let config: AnalysisConfig = serde_json::from_str(
        r#"{"stages": [
            {"name": "early", "since": -1.0, "until": 4.0},
            {"name": "late", "since": 4.0}
        ]}"#,
    )
    .unwrap();
    let report =
        tools::count_events(&event_log, &SignalDefinition::new("S1", "S0"), &config).unwrap();

    assert_eq!(report.stages[0].counts, ChannelCounts::new(5, 0));
    assert_eq!(report.stages[1].counts, ChannelCounts::new(5, 0));
    assert_eq!(report.totals, ChannelCounts::new(10, 0));

    let phosphorescence =
        tools::count_events(&event_log, &SignalDefinition::new("T1", "S0"), &config).unwrap();
    assert_eq!(phosphorescence.totals, ChannelCounts::new(0, 1));
    std::fs::remove_dir_all(&dir).ok();
}

// ========== TCSPC ==========

const BINS: usize = 40;

fn tcspc_config() -> AnalysisConfig {
    AnalysisConfig {
        total_bins: BINS,
        active_bins: 32,
        trim_bins: 2,
        triggered_model: DecayModel::Single,
        prompt_model: DecayModel::Single,
        ..AnalysisConfig::default()
    }
}

fn decay(i: usize, rise: usize, amplitude: f64) -> f64 {
    if i >= rise {
        amplitude * (-0.4 * (i - rise) as f64 * 0.125).exp()
    } else {
        0.0
    }
}

/// 两帧触发导出：帧f的数据位于 detectorA{f-1}/detectorB{f-1}
fn write_trigger_export(path: &Path, background_per_bin: f64) {
    let mut csv = String::from(",trigger_frame,time_bin,detectorA0,detectorB0,detectorA1,detectorB1\n");
    let mut index = 0;
    for frame in 1..=2usize {
        for bin in 0..BINS {
            let a = decay(bin, 6, 600.0 / frame as f64) + background_per_bin;
            let b = a * 0.5;
            let (a0, b0, a1, b1) = if frame == 1 {
                (a, b, 0.0, 0.0)
            } else {
                (0.0, 0.0, a, b)
            };
            csv.push_str(&format!("{index},{frame},{bin},{a0},{b0},{a1},{b1}\n"));
            index += 1;
        }
    }
    write(path, &csv);
}

fn write_prompt_export(path: &Path) {
    let mut csv = String::from("time_bin,detectorA,detectorB\n");
    for bin in (0..BINS).rev() {
        let a = decay(bin, 4, 900.0);
        csv.push_str(&format!("{bin},{a},{}\n", a * 0.5));
    }
    write(path, &csv);
}

#[test]
fn test_tcspc_pipeline_from_tables() {
    log("TCSPC端到端", "TCSPC end to end");
    let dir = temp_dir("tcspc");
    let frames_path = dir.join("day1.csv");
    let bkgd_path = dir.join("day1_bkgd.csv");
    let prompt_path = dir.join("prompt.csv");
    write_trigger_export(&frames_path, 1.0);
    // 均摊到32个有效bin：A每bin 1，B每bin 0.5
    write(
        &bkgd_path,
        "frame,bkgd_group,bkgd_A,bkgd_B\n1,7,32,16\n2,7,32,16\n1,3,999,999\n",
    );
    write_prompt_export(&prompt_path);

    let config = AnalysisConfig {
        background_groups: vec![7],
        ..tcspc_config()
    };
    let dataset = TriggeredDataset {
        label: "day1".to_string(),
        frames: table::read_trigger_frames(&frames_path, BINS).unwrap(),
        background: table::read_background(&bkgd_path).unwrap(),
    };
    assert_eq!(dataset.frames.len(), 2);
    let prompt = table::read_prompt(&prompt_path).unwrap();
    assert_eq!(prompt.channel_a[4], 900.0);

    let report = tools::analyze_tcspc(&[dataset], &[prompt], &config).unwrap();
    let triggered = report.triggered.as_ref().unwrap();
    assert_eq!(report.datasets[0].zero_bin, 5);
    assert_eq!(triggered.zero_bin, 6);
    assert!((triggered.fit.components[0].rate + 0.4).abs() < 1e-4);
    assert_eq!(report.frame_arrivals.len(), 2);
    assert_eq!(report.frame_arrivals[1].delay_us, 60.0);
    assert_eq!(report.zero_shift(), Some(2));

    let out = dir.join("out");
    std::fs::create_dir_all(&out).unwrap();
    let written = tools::write_tcspc_tables(&out, &report).unwrap();
    let names: Vec<String> = written
        .iter()
        .map(|p| tools::utils::extract_filename_lossy(p))
        .collect();
    assert!(names.contains(&"fit_parameters.csv".to_string()));
    assert!(names.contains(&"frame_arrivals.csv".to_string()));

    let params = std::fs::read_to_string(out.join("fit_parameters.csv")).unwrap();
    let mut lines = params.lines();
    assert!(lines.next().unwrap().starts_with("type,model,a1,b1"));
    assert!(lines.next().unwrap().starts_with("triggered,single,"));
    assert!(lines.next().unwrap().starts_with("prompt,single,"));

    let json = tools::to_json(&report).unwrap();
    assert!(json.contains("\"frame_arrivals\""));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_tcspc_missing_background_is_lookup_error() {
    log("缺失背景条目", "Missing background entry");
    let dir = temp_dir("tcspc_lookup");
    let frames_path = dir.join("day1.csv");
    let bkgd_path = dir.join("bkgd.csv");
    write_trigger_export(&frames_path, 0.0);
    write(&bkgd_path, "frame,bkgd_group,bkgd_A,bkgd_B\n1,1,0,0\n");

    let dataset = TriggeredDataset {
        label: "day1".to_string(),
        frames: table::read_trigger_frames(&frames_path, BINS).unwrap(),
        background: table::read_background(&bkgd_path).unwrap(),
    };
    let result = tools::analyze_tcspc(&[dataset], &[], &tcspc_config());
    assert!(matches!(result, Err(AnalysisError::LookupError(_))));

    // bin数与配置不符
    let shape = table::read_trigger_frames(&frames_path, 128);
    assert!(matches!(shape, Err(AnalysisError::ShapeMismatch(_))));
    std::fs::remove_dir_all(&dir).ok();
}

// ========== 副本聚合 ==========

#[test]
fn test_aggregate_directory_with_mixture() {
    log("目录聚合与混合物", "Directory aggregation with mixture");
    let dir = temp_dir("aggregate");
    write(
        &dir.join("fast.csv"),
        "diffusion_time_ns,delay_time_ns,replicate,counts_x,counts_y\n\
         450,100,0,100,50\n\
         450,100,1,110,40\n",
    );
    write(
        &dir.join("slow.csv"),
        "diff_time_ns,delay_ns,replicate,x,y\n\
         3000,100,0,80,60\n\
         3000,100,1,70,70\n",
    );

    let files = tools::scan_table_files(&dir).unwrap();
    assert_eq!(files.len(), 2);
    let records = tools::load_replicates_parallel(&files, 2, false)
        .unwrap()
        .into_records()
        .unwrap();
    assert_eq!(records.len(), 4);

    let plans: Vec<MixturePlan> = vec!["450:0+3000:0".parse().unwrap()];
    let report = tools::aggregate_records(&records, &plans, ChannelOrder::XMajor).unwrap();
    assert_eq!(report.summary.len(), 2);
    assert_eq!(report.summary[0].n_replicates, 2);
    assert_eq!(report.summary[0].mean_x, 105.0);
    assert_eq!(report.mixtures[0].points[0].1, ChannelCounts::new(180, 110));

    let out = dir.join("out");
    std::fs::create_dir_all(&out).unwrap();
    tools::write_aggregate_tables(&out, &report).unwrap();
    let mixtures = std::fs::read_to_string(out.join("mixtures.csv")).unwrap();
    assert!(mixtures.lines().any(|l| l == "0,450-3000,,100,180,110"));

    // 不存在的副本
    let missing: Vec<MixturePlan> = vec!["450:5+3000:0".parse().unwrap()];
    assert!(matches!(
        tools::aggregate_records(&records, &missing, ChannelOrder::XMajor),
        Err(AnalysisError::LookupError(_))
    ));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_config_file_roundtrip_through_loader() {
    log("配置文件加载", "Config file loading");
    let dir = temp_dir("config");
    let path = dir.join("analysis.json");
    write(
        &path,
        r#"{"g_factor": 1.1, "background_groups": [7, 8],
            "background_exclusions": [{"group": 8, "before_frame": 9}],
            "prompt_model": "single"}"#,
    );
    let config = AnalysisConfig::load(&path).unwrap();
    assert_eq!(config.g_factor, 1.1);
    assert_eq!(config.background_exclusions[0].before_frame, 9);
    assert_eq!(config.prompt_model, DecayModel::Single);

    write(&path, r#"{"active_bins": 0}"#);
    assert!(AnalysisConfig::load(&path).is_err());
    write(&path, "not json");
    assert!(matches!(
        AnalysisConfig::load(&path),
        Err(AnalysisError::FormatError(_))
    ));
    std::fs::remove_dir_all(&dir).ok();
}
