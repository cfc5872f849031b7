//! 工具模块集合
//!
//! 包含CLI、配置、表格读写、分析管线、格式化等工具模块，支持main.rs的流程控制。

pub mod cli;
pub mod config;
pub mod constants;
pub mod formatter;
pub mod parallel_processor;
pub mod processor;
pub mod scanner;
pub mod table;
pub mod utils;

// 重新导出主要的公共接口
pub use cli::{AppConfig, Mode, parse_args, show_completion_info, show_startup_info};
pub use config::{AnalysisConfig, ArrivalWindow, BackgroundExclusion, StageWindow};
pub use formatter::{
    create_report_header, format_aggregate_report, format_count_report, format_tcspc_report,
    to_json, write_aggregate_tables, write_count_tables, write_output, write_tcspc_tables,
};
pub use parallel_processor::{BatchLoad, load_replicates_parallel, load_replicates_serial};
pub use processor::{
    AggregateReport, CountReport, TcspcReport, TimeBinning, TimeResolvedReport, TriggeredDataset,
    aggregate_records, analyze_tcspc, count_events, time_resolved,
};
pub use scanner::{create_batch_footer, resolve_inputs, scan_table_files, show_scan_results};
pub use utils::path;
