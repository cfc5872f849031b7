//! 寿命与平均到达时间估计
//!
//! 两种互补的估计：
//! - **平均到达时间**：`Σ(c_i·i) / Σc_i`，换算为相对零点的纳秒。
//!   采集窗口截断了衰减尾部，因此这是近似量，并非真实寿命
//!   （寿命越长偏差越大）。
//! - **尾部拟合**：对峰后尾部做单/双指数非线性最小二乘，
//!   由协方差对角线给出参数标准误。
//!
//! 拟合时间轴使用绝对bin时间 `bin × ns_per_bin`，与零点无关，
//! 因此振幅参数的含义依赖于零点所在位置。

use crate::error::{fit_error, AnalysisError, AnalysisResult};
use crate::processing::least_squares::{levenberg_marquardt, CurveModel, SolverOptions};
use crate::tools::constants::fitting;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// 衰减模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayModel {
    /// `a·exp(b·t)`
    #[default]
    Single,

    /// `a·exp(b·t) + c·exp(d·t)`
    Double,
}

impl DecayModel {
    /// 指数项个数
    pub fn n_terms(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Double => 2,
        }
    }

    /// 固定初值
    pub fn default_guess(&self) -> Vec<f64> {
        match self {
            Self::Single => fitting::SINGLE_EXP_GUESS.to_vec(),
            Self::Double => fitting::DOUBLE_EXP_GUESS.to_vec(),
        }
    }
}

impl fmt::Display for DecayModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Double => write!(f, "double"),
        }
    }
}

impl CurveModel for DecayModel {
    fn n_params(&self) -> usize {
        2 * self.n_terms()
    }

    fn eval(&self, t: f64, params: &[f64]) -> f64 {
        params
            .chunks_exact(2)
            .map(|term| term[0] * (term[1] * t).exp())
            .sum()
    }

    fn gradient(&self, t: f64, params: &[f64], out: &mut [f64]) {
        for (term, grad) in params.chunks_exact(2).zip(out.chunks_exact_mut(2)) {
            let e = (term[1] * t).exp();
            grad[0] = e;
            grad[1] = term[0] * t * e;
        }
    }
}

/// 信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// 单次泵浦后的即时荧光
    Prompt,
    /// 触发帧（泵浦-探测延迟）信号
    Triggered,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prompt => write!(f, "prompt"),
            Self::Triggered => write!(f, "triggered"),
        }
    }
}

/// 单个指数分量
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpComponent {
    pub amplitude: f64,
    pub rate: f64,
    pub amplitude_std: f64,
    pub rate_std: f64,
}

impl ExpComponent {
    /// 寿命 `-1/b`（纳秒）
    #[inline]
    pub fn lifetime(&self) -> f64 {
        -1.0 / self.rate
    }
}

/// 尾部拟合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub signal: SignalKind,
    pub model: DecayModel,
    pub components: Vec<ExpComponent>,
    /// 振幅加权平均寿命（仅双指数）
    pub weighted_mean_lifetime: Option<f64>,
    /// 拟合点时间（纳秒）
    pub times: Vec<f64>,
    /// 残差 `y - f(t)`
    pub residuals: Vec<f64>,
    pub ssr: f64,
}

/// 振幅加权平均寿命 `Σ aᵢ(-1/bᵢ) / Σ aᵢ`
pub fn weighted_mean_lifetime(components: &[ExpComponent]) -> f64 {
    let total: f64 = components.iter().map(|c| c.amplitude).sum();
    components
        .iter()
        .map(|c| c.amplitude * c.lifetime())
        .sum::<f64>()
        / total
}

/// 平均到达时间（纳秒，相对零点）
///
/// 直方图总计数为0时返回NaN（软失败，不报错）。
pub fn mean_arrival_time(histogram: &[f64], zero_bin: usize, ns_per_bin: f64) -> f64 {
    let total: f64 = histogram.iter().sum();
    if total == 0.0 {
        return f64::NAN;
    }
    let weighted: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, c)| c * i as f64)
        .sum();
    super::alignment::utils::bins_to_ns(weighted / total, zero_bin, ns_per_bin)
}

/// 尾部窗口参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TailWindow {
    /// 峰后跳过的bin数
    pub dead_time_offset: usize,
    /// 有效bin数
    pub active_bins: usize,
    /// 末尾丢弃的bin数
    pub trim_bins: usize,
    pub ns_per_bin: f64,
}

impl TailWindow {
    /// 拟合区间 `[zero_bin + offset, active_bins - trim_bins)`
    pub fn range(&self, zero_bin: usize) -> std::ops::Range<usize> {
        let start = zero_bin + self.dead_time_offset;
        let end = self.active_bins.saturating_sub(self.trim_bins);
        start..end
    }

    /// 截取尾部，返回 (绝对时间, 计数)
    pub fn extract(&self, signal: &[f64], zero_bin: usize) -> AnalysisResult<(Vec<f64>, Vec<f64>)> {
        let range = self.range(zero_bin);
        if range.is_empty() || range.end > signal.len() {
            return Err(AnalysisError::InvalidInput(format!(
                "尾部窗口 {}..{} 超出信号长度 {} 或为空",
                range.start,
                range.end,
                signal.len()
            )));
        }
        let times = range.clone().map(|i| i as f64 * self.ns_per_bin).collect();
        let counts = signal[range].to_vec();
        Ok((times, counts))
    }
}

/// 对尾部数据做指数拟合
///
/// # 参数
///
/// * `signal` - 信号类型（记录在结果中）
/// * `times`, `counts` - 尾部窗口数据
/// * `model` - 单/双指数
/// * `guess` - 初值，`None` 时使用固定初值
/// * `condition` - 条件标识，失败时写入错误
pub fn tail_fit(
    signal: SignalKind,
    times: &[f64],
    counts: &[f64],
    model: DecayModel,
    guess: Option<&[f64]>,
    condition: &str,
) -> AnalysisResult<FitResult> {
    let initial = guess.map_or_else(|| model.default_guess(), <[f64]>::to_vec);
    if initial.len() != model.n_params() {
        return Err(AnalysisError::InvalidInput(format!(
            "{model} 模型需要 {} 个初值，实际 {}",
            model.n_params(),
            initial.len()
        )));
    }

    let solution = levenberg_marquardt(&model, times, counts, &initial, &SolverOptions::default())
        .map_err(|e| fit_error(model, condition, e.to_string()))?;

    if solution.params.iter().any(|p| !p.is_finite()) {
        return Err(fit_error(model, condition, "参数非有限"));
    }

    let std_errors = solution.std_errors();
    let components: Vec<ExpComponent> = solution
        .params
        .chunks_exact(2)
        .zip(std_errors.chunks_exact(2))
        .map(|(p, s)| ExpComponent {
            amplitude: p[0],
            rate: p[1],
            amplitude_std: s[0],
            rate_std: s[1],
        })
        .collect();

    let weighted = match model {
        DecayModel::Single => None,
        DecayModel::Double => Some(weighted_mean_lifetime(&components)),
    };

    let residuals = times
        .iter()
        .zip(counts)
        .map(|(&t, &y)| y - model.eval(t, &solution.params))
        .collect();

    debug!(
        %model,
        condition,
        iterations = solution.iterations,
        ssr = solution.ssr,
        "尾部拟合完成"
    );
    if let Some(tau) = weighted {
        info!(%model, condition, tau_avg = tau, "加权平均寿命");
    }

    Ok(FitResult {
        signal,
        model,
        components,
        weighted_mean_lifetime: weighted,
        times: times.to_vec(),
        residuals,
        ssr: solution.ssr,
    })
}
