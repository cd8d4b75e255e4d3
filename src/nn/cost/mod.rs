/*
 * @Author       : 老董
 * @Date         : 2026-10-11
 * @Description  : 代价函数（Cost）：挂接在网络末端层上，给出标量代价与反向传播的入口误差
 *
 * 缓冲区布局与层一致：每列一个样本（序列为 T*bsz 列）。
 * - outputs：每个样本的代价，形状(1, 列数)
 * - cost：全批平均代价，形状(1, 1)
 * - deltas：对末端层输出的误差，形状同末端层输出
 */

mod multicost;

pub use multicost::Multicost;

use super::shape::Terminal;
use crate::backend::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 对数运算的下限（2^-23），避免log(0)
const EPSILON: f32 = 1.0 / 8_388_608.0;

fn safelog(x: f32) -> f32 {
    x.max(EPSILON).ln()
}

// ==================== CostFunction ====================

/// 逐样本的代价函数及其导数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostFunction {
    /// `0.5 * Σ(y - t)²`
    SumSquared,
    /// `0.5 * mean((y - t)²)`
    MeanSquared,
    /// 二分类交叉熵，导数按`y - t`给出（假定前一层为Logistic）
    CrossEntropyBinary,
    /// 多分类交叉熵，导数按`y - t`给出（假定前一层输出已归一化为概率）
    CrossEntropyMulti,
}

impl CostFunction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SumSquared => "SumSquared",
            Self::MeanSquared => "MeanSquared",
            Self::CrossEntropyBinary => "CrossEntropyBinary",
            Self::CrossEntropyMulti => "CrossEntropyMulti",
        }
    }

    /// 每一列（样本）的代价
    pub fn apply(&self, y: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array1<f32> {
        let nout = y.nrows().max(1) as f32;
        let mut elem = Array2::<f32>::zeros(y.raw_dim());
        Zip::from(&mut elem).and(&y).and(&t).for_each(|e, &y, &t| {
            *e = match self {
                Self::SumSquared | Self::MeanSquared => 0.5 * (y - t) * (y - t),
                Self::CrossEntropyBinary => -t * safelog(y) - (1.0 - t) * safelog(1.0 - y),
                Self::CrossEntropyMulti => -t * safelog(y),
            };
        });
        let per_sample = elem.sum_axis(Axis(0));
        match self {
            Self::MeanSquared => per_sample / nout,
            _ => per_sample,
        }
    }

    /// 代价对`y`的导数
    pub fn derivative(&self, y: ArrayView2<'_, f32>, t: ArrayView2<'_, f32>) -> Array2<f32> {
        let diff = &y - &t;
        match self {
            Self::MeanSquared => diff / y.nrows().max(1) as f32,
            _ => diff,
        }
    }
}

impl fmt::Display for CostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== GeneralizedCost ====================

/// 一个代价函数 + 它在某个末端层上的缓冲区
#[derive(Debug)]
pub struct GeneralizedCost {
    name: String,
    func: CostFunction,
    /// 挂接的末端层名
    terminal: Option<String>,
    in_dims: Option<(usize, usize)>,
    outputs: Option<Buffer>,
    cost: Option<Buffer>,
    deltas: Option<Buffer>,
}

impl GeneralizedCost {
    pub fn new(func: CostFunction) -> Self {
        Self {
            name: func.as_str().to_string(),
            func,
            terminal: None,
            in_dims: None,
            outputs: None,
            cost: None,
            deltas: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn func(&self) -> CostFunction {
        self.func
    }

    pub fn terminal(&self) -> Option<&str> {
        self.terminal.as_deref()
    }

    /// 按末端层的输出形状分配缓冲区
    pub fn initialize(&mut self, be: &Backend, terminal: &Terminal) -> Result<()> {
        let (rows, cols) = be.buffer_dims(&terminal.out_shape);
        self.in_dims = Some((rows, cols));
        self.outputs = Some(Buffer::zeros(1, cols));
        self.cost = Some(Buffer::zeros(1, 1));
        self.deltas = Some(Buffer::zeros(rows, cols));
        self.terminal = Some(terminal.name.clone());
        tracing::debug!(cost = %self.name, terminal = %terminal.name, rows, cols, "代价函数挂接完成");
        Ok(())
    }

    fn check_pair(&self, inputs: &Buffer, targets: &Buffer) -> Result<()> {
        let expected = self
            .in_dims
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))?;
        for (what, dims) in [("预测", inputs.dims()), ("目标", targets.dims())] {
            if dims != expected {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![expected.0, expected.1],
                    got: vec![dims.0, dims.1],
                    message: format!("{}收到的{what}形状与末端层输出不符", self.name),
                });
            }
        }
        Ok(())
    }

    /// 计算每个样本的代价与全批平均代价，返回形状为(1, 1)的`cost`缓冲区
    pub fn get_cost(&mut self, inputs: &Buffer, targets: &Buffer) -> Result<Buffer> {
        self.check_pair(inputs, targets)?;
        let (y, t) = (inputs.to_array(), targets.to_array());
        let per_sample = self.func.apply(y.view(), t.view());
        let mean = per_sample.mean().unwrap_or(0.0);

        let outputs = self.outputs()?;
        outputs.assign(per_sample.view().insert_axis(Axis(0)))?;
        let cost = self.cost()?;
        cost.fill(mean);
        Ok(cost)
    }

    /// 计算对末端层输出的误差，返回`deltas`缓冲区
    pub fn get_errors(&mut self, inputs: &Buffer, targets: &Buffer) -> Result<Buffer> {
        self.check_pair(inputs, targets)?;
        let (y, t) = (inputs.to_array(), targets.to_array());
        let grad = self.func.derivative(y.view(), t.view());
        let deltas = self.deltas()?;
        deltas.assign(grad.view())?;
        Ok(deltas)
    }

    pub fn outputs(&self) -> Result<Buffer> {
        self.outputs
            .clone()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))
    }

    pub fn cost(&self) -> Result<Buffer> {
        self.cost
            .clone()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))
    }

    pub fn deltas(&self) -> Result<Buffer> {
        self.deltas
            .clone()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))
    }

    /// 当前的平均代价（尚未计算时为0）
    pub fn value(&self) -> f32 {
        self.cost.as_ref().map_or(0.0, |c| c.to_array()[[0, 0]])
    }
}

impl From<CostFunction> for GeneralizedCost {
    fn from(func: CostFunction) -> Self {
        Self::new(func)
    }
}
