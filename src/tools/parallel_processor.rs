//! 多文件并行加载模块
//!
//! 使用rayon实现文件级并行读取副本表，保证记录顺序与文件顺序一致。

use super::{table, utils};
use crate::core::aggregate::ReplicateRecord;
use crate::error::{AnalysisError, AnalysisResult, ErrorCategory, calculation_error};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 有序结果容器（保证输出顺序）
struct OrderedResult {
    /// 原始文件索引（用于排序）
    index: usize,

    /// 处理结果
    result: AnalysisResult<Vec<ReplicateRecord>>,
}

/// 批量加载结果
#[derive(Debug, Default)]
pub struct BatchLoad {
    /// 按文件顺序拼接的记录
    pub records: Vec<ReplicateRecord>,
    pub processed: usize,
    pub failed: usize,
    /// 按类别统计的失败文件名
    pub error_stats: HashMap<ErrorCategory, Vec<String>>,
}

impl BatchLoad {
    /// 全部文件失败时返回错误
    pub fn into_records(self) -> AnalysisResult<Vec<ReplicateRecord>> {
        if self.processed == 0 {
            let mut categories: Vec<_> = self.error_stats.keys().copied().collect();
            categories.sort();
            let names: Vec<&str> = categories.iter().map(|c| c.display_name()).collect();
            return Err(AnalysisError::InvalidInput(format!(
                "没有成功读取的副本表 ({} 个失败: {})",
                self.failed,
                names.join(", ")
            )));
        }
        Ok(self.records)
    }
}

fn load_one(
    index: usize,
    file: &Path,
    total: usize,
    verbose: bool,
    processed_count: &AtomicUsize,
    failed_count: &AtomicUsize,
    error_stats: &Mutex<HashMap<ErrorCategory, Vec<String>>>,
) -> OrderedResult {
    let result = table::read_replicates(file);
    let filename = utils::extract_filename_lossy(file);

    // 更新统计（线程安全）
    match &result {
        Ok(records) => {
            let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
            if verbose {
                println!("[OK] [{count}/{total}] {filename} ({} 条记录)", records.len());
            }
        }
        Err(e) => {
            let count = failed_count.fetch_add(1, Ordering::Relaxed) + 1;
            let category = ErrorCategory::from_analysis_error(e);
            if let Ok(mut stats) = error_stats.lock() {
                stats.entry(category).or_default().push(filename.clone());
            }
            tracing::warn!(file = %filename, error = %e, "副本表读取失败");
            if verbose {
                println!("[FAIL] [{count}/{total}] {filename} - {e}");
            }
        }
    }

    OrderedResult { index, result }
}

fn collect(
    results: Vec<OrderedResult>,
    processed_count: &AtomicUsize,
    failed_count: &AtomicUsize,
    error_stats: Arc<Mutex<HashMap<ErrorCategory, Vec<String>>>>,
) -> BatchLoad {
    // 按原始顺序排序结果
    let mut sorted_results = results;
    sorted_results.sort_by_key(|r| r.index);

    let records = sorted_results
        .into_iter()
        .filter_map(|r| r.result.ok())
        .flatten()
        .collect();

    let error_stats = match Arc::try_unwrap(error_stats) {
        Ok(mutex) => mutex.into_inner().unwrap_or_default(),
        Err(shared) => shared.lock().map(|s| s.clone()).unwrap_or_default(),
    };

    BatchLoad {
        records,
        processed: processed_count.load(Ordering::Relaxed),
        failed: failed_count.load(Ordering::Relaxed),
        error_stats,
    }
}

/// 多文件并行加载
///
/// 使用独立的rayon线程池控制并发度；单个文件失败只计入统计，不中断批次。
pub fn load_replicates_parallel(
    files: &[PathBuf],
    parallel_degree: usize,
    verbose: bool,
) -> AnalysisResult<BatchLoad> {
    println!("[INFO] 启用多文件并行加载：{parallel_degree} 并发度");

    let error_stats = Arc::new(Mutex::new(HashMap::<ErrorCategory, Vec<String>>::new()));
    let processed_count = Arc::new(AtomicUsize::new(0));
    let failed_count = Arc::new(AtomicUsize::new(0));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallel_degree)
        .thread_name(|i| format!("table-worker-{i}"))
        .build()
        .map_err(|e| calculation_error("线程池创建失败", e))?;

    let results: Vec<OrderedResult> = pool.install(|| {
        files
            .par_iter()
            .enumerate()
            .map(|(index, file)| {
                load_one(
                    index,
                    file,
                    files.len(),
                    verbose,
                    &processed_count,
                    &failed_count,
                    &error_stats,
                )
            })
            .collect()
    });

    Ok(collect(results, &processed_count, &failed_count, error_stats))
}

/// 串行加载（与并行模式输出一致）
pub fn load_replicates_serial(files: &[PathBuf], verbose: bool) -> BatchLoad {
    let error_stats = Arc::new(Mutex::new(HashMap::<ErrorCategory, Vec<String>>::new()));
    let processed_count = AtomicUsize::new(0);
    let failed_count = AtomicUsize::new(0);

    let results: Vec<OrderedResult> = files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            load_one(
                index,
                file,
                files.len(),
                verbose,
                &processed_count,
                &failed_count,
                &error_stats,
            )
        })
        .collect();

    collect(results, &processed_count, &failed_count, error_stats)
}
