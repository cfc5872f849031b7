//! 常量和默认配置集中管理
//!
//! 将仪器与拟合相关的常量集中定义，避免"默认值漂移"和重复定义

/// TCSPC采集常量
pub mod tcspc {
    /// 每个采集导出的总bin数（含尾部填充）
    pub const TOTAL_BINS: usize = 128;

    /// 有效bin数：100-127为仪器填充，不参与分析
    pub const ACTIVE_BINS: usize = 100;

    /// 采集窗口总长（纳秒）
    pub const WINDOW_NS: f64 = 12.5;

    /// 每bin纳秒数
    pub const NS_PER_BIN: f64 = WINDOW_NS / ACTIVE_BINS as f64;

    /// 拟合前丢弃的尾部bin数（最后约1ns质量不稳定）
    pub const TRIM_BINS: usize = 8;

    /// 峰值后跳过的bin数（探测器死时间）
    pub const DEAD_TIME_OFFSET: usize = 2;

    /// 触发帧间隔（微秒），延迟 = (frame - 1) × 周期
    pub const FRAME_PERIOD_US: f64 = 60.0;
}

/// 尾部拟合常量
pub mod fitting {
    /// 单指数模型固定初值 (a, b)
    pub const SINGLE_EXP_GUESS: [f64; 2] = [730.0, -0.2];

    /// 双指数模型固定初值 (a, b, c, d)
    pub const DOUBLE_EXP_GUESS: [f64; 4] = [200.0, -0.2, 1000.0, -0.6];

    /// 最大迭代次数
    pub const MAX_ITERATIONS: usize = 2000;

    /// 代价函数相对下降容差
    pub const FTOL: f64 = 1.49012e-8;

    /// 参数步长相对容差
    pub const XTOL: f64 = 1.49012e-8;

    /// Levenberg-Marquardt 初始阻尼
    pub const INITIAL_LAMBDA: f64 = 1e-3;

    /// 阻尼上限，超过即判定无法继续下降
    pub const MAX_LAMBDA: f64 = 1e16;
}

/// 默认配置值
pub mod defaults {
    /// 默认随机种子
    pub const SEED: u64 = 0;

    /// 默认多文件并行并发度
    pub const PARALLEL_FILES_DEGREE: usize = 4;
}

/// 并发度限制常量
pub mod parallel_limits {
    /// 最小并发度
    pub const MIN_PARALLEL_DEGREE: usize = 1;

    /// 最大并发度
    pub const MAX_PARALLEL_DEGREE: usize = 16;
}
