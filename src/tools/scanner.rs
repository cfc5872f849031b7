//! 文件扫描模块
//!
//! 负责扫描目录中的副本计数表（CSV）。

use super::utils;
use crate::error::{AnalysisError, AnalysisResult};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 支持的表格扩展名
const SUPPORTED_EXTENSIONS: &[&str] = &["csv"];

/// 递归扫描目录中的表格文件（按路径排序）
pub fn scan_table_files(dir_path: &Path) -> AnalysisResult<Vec<PathBuf>> {
    if !dir_path.exists() {
        return Err(AnalysisError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("目录不存在: {}", dir_path.display()),
        )));
    }

    if !dir_path.is_dir() {
        return Err(AnalysisError::InvalidInput(format!(
            "路径不是目录: {}",
            dir_path.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir_path).follow_links(true) {
        let entry = entry.map_err(|e| {
            AnalysisError::IoError(std::io::Error::other(format!("目录遍历失败: {e}")))
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(extension) = path.extension()
            && let Some(ext_str) = extension.to_str()
        {
            let ext_lower = ext_str.to_lowercase();
            if SUPPORTED_EXTENSIONS.contains(&ext_lower.as_str()) {
                files.push(path.to_path_buf());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// 输入为文件时直接返回，为目录时扫描
pub fn resolve_inputs(input: &Path) -> AnalysisResult<Vec<PathBuf>> {
    if input.is_file() {
        Ok(vec![input.to_path_buf()])
    } else {
        scan_table_files(input)
    }
}

/// 显示文件扫描结果
pub fn show_scan_results(input: &Path, files: &[PathBuf], verbose: bool) {
    if files.is_empty() {
        println!("[WARN] 在目录 {} 中没有找到表格文件", input.display());
        println!("   支持的格式: CSV");
        return;
    }

    println!("[INFO] 扫描目录 / Scanning: {}", input.display());
    println!("[INFO] 找到 {} 个表格文件 / tables found", files.len());

    if verbose {
        for (i, file) in files.iter().enumerate() {
            println!("   {}. {}", i + 1, utils::extract_filename_lossy(file));
        }
    }
    println!();
}

/// 生成批量加载的统计信息
pub fn create_batch_footer(total: usize, processed_count: usize, failed_count: usize) -> String {
    let mut output = String::new();

    output.push_str("=====================================\n");
    output.push_str("批量加载统计 / Batch summary:\n");
    output.push_str(&format!("   总文件数: {total}\n"));
    output.push_str(&format!("   成功处理: {processed_count}\n"));
    output.push_str(&format!("   处理失败: {failed_count}\n"));
    if total > 0 {
        output.push_str(&format!(
            "   处理成功率: {:.1}%\n",
            processed_count as f64 / total as f64 * 100.0
        ));
    }
    output
}
