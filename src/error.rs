//! 统一错误处理框架
//!
//! 分析管线的错误分类：查找错误、形状不匹配、拟合不收敛，
//! 以及输入/IO/表格格式错误。空直方图不是错误，由调用方得到NaN。

use std::fmt;
use std::io;

/// 分析管线相关的统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// 输入验证错误（参数非法、窗口为空等）
    #[error("输入验证失败: {0}")]
    InvalidInput(String),

    /// 文件I/O错误
    #[error("文件I/O错误: {0}")]
    IoError(#[from] io::Error),

    /// 表格格式错误（缺列、无法解析的数值等）
    #[error("表格格式错误: {0}")]
    FormatError(String),

    /// 背景/帧查找失败：条目缺失或不唯一
    #[error("查找失败: {0}")]
    LookupError(String),

    /// 时间轴不一致（延迟轴、bin数量）
    #[error("形状不匹配: {0}")]
    ShapeMismatch(String),

    /// 非线性最小二乘未收敛或得到非有限参数
    #[error("拟合未收敛 [{model} @ {condition}]: {reason}")]
    FitConvergence {
        /// 尝试的衰减模型
        model: String,
        /// 条件标识（信号类型、数据集等）
        condition: String,
        /// 失败原因
        reason: String,
    },

    /// 计算异常
    #[error("计算异常: {0}")]
    CalculationError(String),
}

/// 分析操作的标准Result类型
pub type AnalysisResult<T> = Result<T, AnalysisError>;

// ==================== 错误转换Helper函数 ====================

/// 创建表格格式错误的helper函数
#[inline]
pub fn format_error<E: fmt::Display>(context: &str, err: E) -> AnalysisError {
    AnalysisError::FormatError(format!("{context}: {err}"))
}

/// 创建计算错误的helper函数
#[inline]
pub fn calculation_error<E: fmt::Display>(context: &str, err: E) -> AnalysisError {
    AnalysisError::CalculationError(format!("{context}: {err}"))
}

/// 创建拟合错误的helper函数
#[inline]
pub fn fit_error(
    model: impl fmt::Display,
    condition: &str,
    reason: impl Into<String>,
) -> AnalysisError {
    AnalysisError::FitConvergence {
        model: model.to_string(),
        condition: condition.to_string(),
        reason: reason.into(),
    }
}

// ==================== 错误分类系统 ====================
// 用于批量处理中的错误统计和退出码映射

/// 错误类别枚举
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// 输入/表格格式问题
    Input,
    /// I/O相关错误
    Io,
    /// 背景或帧查找失败
    Lookup,
    /// 时间轴或bin数不一致
    Shape,
    /// 拟合与数值计算问题
    Calculation,
}

impl ErrorCategory {
    /// 从AnalysisError提取错误类别
    pub fn from_analysis_error(e: &AnalysisError) -> Self {
        match e {
            AnalysisError::InvalidInput(_) | AnalysisError::FormatError(_) => Self::Input,
            AnalysisError::IoError(_) => Self::Io,
            AnalysisError::LookupError(_) => Self::Lookup,
            AnalysisError::ShapeMismatch(_) => Self::Shape,
            AnalysisError::FitConvergence { .. } | AnalysisError::CalculationError(_) => {
                Self::Calculation
            }
        }
    }

    /// 获取错误类别的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Input => "输入错误",
            Self::Io => "I/O错误",
            Self::Lookup => "查找错误",
            Self::Shape => "形状错误",
            Self::Calculation => "计算错误",
        }
    }
}
