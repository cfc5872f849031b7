//! Levenberg-Marquardt 非线性最小二乘
//!
//! 面向少参数（≤ 4）曲线模型的小型稠密实现：
//! - Marquardt 对角缩放阻尼
//! - 收敛判据：实际与预测的相对代价下降都不超过 `ftol`，或步长相对 `xtol`
//! - 协方差 `s²·(JᵀJ)⁻¹`，`s² = SSR / (m - n)`（未知噪声尺度的估计）

use crate::tools::constants::fitting;
use tracing::{debug, warn};

/// 可拟合的曲线模型
pub trait CurveModel {
    /// 参数个数
    fn n_params(&self) -> usize;

    /// 在 `t` 处求值
    fn eval(&self, t: f64, params: &[f64]) -> f64;

    /// 对各参数的偏导数，写入 `out`（长度为 `n_params`）
    fn gradient(&self, t: f64, params: &[f64], out: &mut [f64]);
}

/// 求解器参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub initial_lambda: f64,
    pub max_lambda: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: fitting::MAX_ITERATIONS,
            ftol: fitting::FTOL,
            xtol: fitting::XTOL,
            initial_lambda: fitting::INITIAL_LAMBDA,
            max_lambda: fitting::MAX_LAMBDA,
        }
    }
}

/// 求解失败原因
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("数据点数 {points} 不足以确定 {params} 个参数")]
    InsufficientData { points: usize, params: usize },

    #[error("x/y 长度不一致: {0} vs {1}")]
    LengthMismatch(usize, usize),

    #[error("初值或迭代中出现非有限值")]
    NonFinite,

    #[error("超过最大迭代次数 {0}")]
    MaxIterations(usize),

    #[error("阻尼增大到上限仍无法降低残差")]
    Stalled,
}

/// 求解结果
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub params: Vec<f64>,
    /// 参数协方差（奇异时为 +inf）
    pub covariance: Vec<Vec<f64>>,
    /// 残差平方和
    pub ssr: f64,
    pub iterations: usize,
}

impl Solution {
    /// 参数标准误（协方差对角线开方）
    pub fn std_errors(&self) -> Vec<f64> {
        (0..self.params.len())
            .map(|i| self.covariance[i][i].sqrt())
            .collect()
    }
}

/// 残差 `y - f(t)`
fn residuals<M: CurveModel>(model: &M, x: &[f64], y: &[f64], params: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(y)
        .map(|(&t, &yi)| yi - model.eval(t, params))
        .collect()
}

fn sum_squares(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

fn norm(values: &[f64]) -> f64 {
    sum_squares(values).sqrt()
}

/// 雅可比矩阵（m × n，按行存储）
fn jacobian<M: CurveModel>(model: &M, x: &[f64], params: &[f64]) -> Vec<Vec<f64>> {
    let n = params.len();
    x.iter()
        .map(|&t| {
            let mut row = vec![0.0; n];
            model.gradient(t, params, &mut row);
            row
        })
        .collect()
}

/// `JᵀJ` 与 `Jᵀr`
fn normal_equations(jac: &[Vec<f64>], r: &[f64], n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut jtj = vec![vec![0.0; n]; n];
    let mut jtr = vec![0.0; n];
    for (row, &ri) in jac.iter().zip(r) {
        for i in 0..n {
            jtr[i] += row[i] * ri;
            for j in i..n {
                jtj[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..n {
        for j in 0..i {
            jtj[i][j] = jtj[j][i];
        }
    }
    (jtj, jtr)
}

/// 部分主元高斯消元求解 `A·x = b`；奇异返回 None
fn solve_linear(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    let mut m: Vec<Vec<f64>> = a
        .iter()
        .zip(b)
        .map(|(row, &bi)| {
            let mut r = row.clone();
            r.push(bi);
            r
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < f64::MIN_POSITIVE || !m[pivot][col].is_finite() {
            return None;
        }
        m.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = m[row][col] / m[col][col];
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let tail: f64 = ((i + 1)..n).map(|k| m[i][k] * x[k]).sum();
        x[i] = (m[i][n] - tail) / m[i][i];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// 逐列求解得到逆矩阵
fn invert(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut columns = Vec::with_capacity(n);
    for c in 0..n {
        let mut e = vec![0.0; n];
        e[c] = 1.0;
        columns.push(solve_linear(a, &e)?);
    }
    Some(
        (0..n)
            .map(|i| (0..n).map(|j| columns[j][i]).collect())
            .collect(),
    )
}

/// Levenberg-Marquardt 拟合
///
/// # 参数
///
/// * `model` - 曲线模型
/// * `x`, `y` - 数据点
/// * `initial` - 参数初值
/// * `options` - 迭代控制
pub fn levenberg_marquardt<M: CurveModel>(
    model: &M,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    options: &SolverOptions,
) -> Result<Solution, SolverError> {
    let n = model.n_params();
    let m = x.len();
    if y.len() != m {
        return Err(SolverError::LengthMismatch(m, y.len()));
    }
    if m <= n || initial.len() != n {
        return Err(SolverError::InsufficientData {
            points: m,
            params: n,
        });
    }

    let mut params = initial.to_vec();
    let mut r = residuals(model, x, y, &params);
    let mut cost = sum_squares(&r);
    if !cost.is_finite() {
        return Err(SolverError::NonFinite);
    }
    let cost_floor = f64::EPSILON * f64::EPSILON * sum_squares(y).max(f64::MIN_POSITIVE);
    let mut lambda = options.initial_lambda;

    for iteration in 1..=options.max_iterations {
        let jac = jacobian(model, x, &params);
        let (jtj, jtr) = normal_equations(&jac, &r, n);

        loop {
            let mut damped = jtj.clone();
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += lambda * jtj[i][i].max(1e-12);
            }

            let Some(step) = solve_linear(&damped, &jtr) else {
                lambda *= 10.0;
                if lambda > options.max_lambda {
                    return Err(SolverError::Stalled);
                }
                continue;
            };

            if norm(&step) <= options.xtol * (norm(&params) + options.xtol) {
                debug!(iteration, cost, "步长收敛");
                return finish(model, x, params, cost, iteration);
            }

            let candidate: Vec<f64> = params.iter().zip(&step).map(|(p, s)| p + s).collect();
            let r_new = residuals(model, x, y, &candidate);
            let cost_new = sum_squares(&r_new);

            if cost_new.is_finite() && cost_new < cost {
                // 线性化模型预测的残差
                let predicted: f64 = jac
                    .iter()
                    .zip(&r)
                    .map(|(row, &ri)| {
                        let jd: f64 = row.iter().zip(&step).map(|(a, b)| a * b).sum();
                        (ri - jd).powi(2)
                    })
                    .sum();
                let actual_rel = (cost - cost_new) / cost;
                let predicted_rel = ((cost - predicted) / cost).abs();

                params = candidate;
                r = r_new;
                cost = cost_new;
                lambda = (lambda / 10.0).max(1e-15);

                if cost <= cost_floor
                    || (actual_rel <= options.ftol && predicted_rel <= options.ftol)
                {
                    debug!(iteration, cost, "代价收敛");
                    return finish(model, x, params, cost, iteration);
                }
                break;
            }

            lambda *= 10.0;
            if lambda > options.max_lambda {
                return Err(SolverError::Stalled);
            }
        }
    }

    Err(SolverError::MaxIterations(options.max_iterations))
}

/// 计算协方差并组装结果
fn finish<M: CurveModel>(
    model: &M,
    x: &[f64],
    params: Vec<f64>,
    ssr: f64,
    iterations: usize,
) -> Result<Solution, SolverError> {
    if params.iter().any(|p| !p.is_finite()) {
        return Err(SolverError::NonFinite);
    }

    let n = params.len();
    let dof = (x.len() - n) as f64;
    let s_sq = ssr / dof;
    let jac = jacobian(model, x, &params);
    let (jtj, _) = normal_equations(&jac, &vec![0.0; x.len()], n);

    let covariance = match invert(&jtj) {
        Some(inv) => inv
            .into_iter()
            .map(|row| row.into_iter().map(|v| v * s_sq).collect())
            .collect(),
        None => {
            warn!("JᵀJ 奇异，参数协方差无法估计");
            vec![vec![f64::INFINITY; n]; n]
        }
    };

    Ok(Solution {
        params,
        covariance,
        ssr,
        iterations,
    })
}
