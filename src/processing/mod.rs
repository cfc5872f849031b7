//! 数值处理模块
//!
//! 曲线拟合所需的数值求解器。

pub mod least_squares;

// 重新导出公共接口
pub use least_squares::{CurveModel, Solution, SolverError, SolverOptions, levenberg_marquardt};
