/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : 参数初始化策略
 */

use ndarray::Array2;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// 参数初始化策略
///
/// 参数矩阵一律按`(fan_out, fan_in)`布局：行数为输出单元数，列数为每个输出单元的输入数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Init {
    /// 常数初始化
    Constant(f32),
    /// 全零
    Zeros,
    /// 全一
    Ones,
    /// 均匀分布 [low, high)
    Uniform { low: f32, high: f32 },
    /// 正态分布
    Normal { mean: f32, std: f32 },
    /// Kaiming/He 初始化（适用于 `ReLU`）
    Kaiming,
    /// Xavier/Glorot 初始化（适用于 Sigmoid/Tanh）
    Xavier,
    /// 恒等映射：主对角线为1，其余为0（残差投影用，权重冻结）
    Identity,
}

impl Init {
    /// 是否为保持恒等的初始化（残差模块据此冻结投影层）
    pub const fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// 按`(rows, cols)`生成参数矩阵（使用指定的 RNG）
    pub fn generate(&self, rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
        match self {
            Self::Constant(v) => Array2::from_elem((rows, cols), *v),
            Self::Zeros => Array2::zeros((rows, cols)),
            Self::Ones => Array2::ones((rows, cols)),
            Self::Uniform { low, high } => {
                Array2::from_shape_simple_fn((rows, cols), || rng.gen_range(*low..*high))
            }
            Self::Normal { mean, std } => normal(rows, cols, *mean, *std, rng),
            Self::Kaiming => {
                let std = (2.0 / cols.max(1) as f32).sqrt();
                normal(rows, cols, 0.0, std, rng)
            }
            Self::Xavier => {
                let std = (2.0 / (rows + cols).max(1) as f32).sqrt();
                normal(rows, cols, 0.0, std, rng)
            }
            Self::Identity => Array2::eye(rows.max(cols))
                .slice_move(ndarray::s![..rows, ..cols]),
        }
    }
}

// Box-Muller 变换
fn normal(rows: usize, cols: usize, mean: f32, std: f32, rng: &mut StdRng) -> Array2<f32> {
    let len = rows * cols;
    let mut data = Vec::with_capacity(len);

    while data.len() < len {
        let u1: f32 = rng.gen_range(f32::MIN_POSITIVE..1.0);
        let u2: f32 = rng.gen_range(0.0..1.0);
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        let z0 = mean + std * r * theta.cos();
        let z1 = mean + std * r * theta.sin();

        if z0.is_finite() {
            data.push(z0);
        }
        if data.len() < len && z1.is_finite() {
            data.push(z1);
        }
    }

    Array2::from_shape_vec((rows, cols), data).unwrap_or_else(|_| Array2::zeros((rows, cols)))
}
