//! 工具函数模块
//!
//! 提供文件路径处理与输出目录准备等通用工具函数。

/// 文件路径处理工具函数
pub mod path {
    use std::path::Path;

    /// 提取文件名（统一处理路径提取逻辑）
    #[inline]
    pub fn extract_filename(path: &Path) -> &str {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("Unknown")
    }

    /// 提取文件stem（不含扩展名），用作采集标签
    #[inline]
    pub fn extract_file_stem(path: &Path) -> &str {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("dataset")
    }

    /// 提取文件名（返回String，用于日志显示）
    #[inline]
    pub fn extract_filename_lossy(path: &Path) -> String {
        path.file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

/// 输出目录
pub mod output {
    use crate::error::AnalysisResult;
    use std::path::Path;

    /// 确保输出目录存在
    pub fn ensure_dir(dir: &Path) -> AnalysisResult<()> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            tracing::debug!(dir = %dir.display(), "创建输出目录");
        }
        Ok(())
    }
}

/// 计算实际并发度：限制在允许范围内，且不超过文件数
pub fn effective_parallel_degree(requested: usize, file_count: Option<usize>) -> usize {
    use super::constants::parallel_limits::{MAX_PARALLEL_DEGREE, MIN_PARALLEL_DEGREE};
    let degree = requested.clamp(MIN_PARALLEL_DEGREE, MAX_PARALLEL_DEGREE);
    match file_count {
        Some(n) => degree.min(n.max(1)),
        None => degree,
    }
}

// 重新导出为平级函数
pub use output::ensure_dir;
pub use path::{extract_file_stem, extract_filename, extract_filename_lossy};
