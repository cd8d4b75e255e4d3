/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : Activation 层：逐元素非线性变换，原地写入
 */

use super::{LayerBase, LayerKind, Leaf};
use crate::backend::Buffer;
use crate::errors::Result;
use crate::nn::Shape;
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use ndarray::Zip;
use serde::{Deserialize, Serialize};

/// 逐元素变换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    Identity,
    Rectlin,
    Logistic,
    Tanh,
}

impl Transform {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Rectlin => x.max(0.0),
            Self::Logistic => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }

    /// 以变换后的值`y`表示的导数
    pub fn derivative(self, y: f32) -> f32 {
        match self {
            Self::Identity => 1.0,
            Self::Rectlin => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Logistic => y * (1.0 - y),
            Self::Tanh => 1.0 - y * y,
        }
    }
}

#[derive(Debug)]
pub struct Activation {
    base: LayerBase,
    transform: Transform,
}

impl Activation {
    pub fn new(transform: Transform) -> Self {
        Self {
            base: LayerBase::new("Activation"),
            transform,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub const fn transform(&self) -> Transform {
        self.transform
    }
}

impl Leaf for Activation {
    const KIND: LayerKind = LayerKind::Activation;
    const OWNS_OUTPUT: bool = false;

    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn infer_out_shape(&self, in_shape: &Shape) -> Result<Shape> {
        Ok(in_shape.clone())
    }

    fn forward(&mut self, x: &Buffer, _inference: bool) -> Result<()> {
        let t = self.transform;
        x.with_view_mut(|mut v| v.mapv_inplace(|a| t.apply(a)))?;
        self.base.inputs = Some(x.clone());
        self.base.outputs = Some(x.clone());
        Ok(())
    }

    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()> {
        let t = self.transform;
        let mut grad = error.to_array();
        let y = self.base.outputs()?.to_array();
        Zip::from(&mut grad)
            .and(&y)
            .for_each(|g, &y| *g *= t.derivative(y));
        self.base.write_deltas(grad.view(), alpha, beta)
    }

    fn describe(&self, _get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(
            LayerKind::Activation,
            &self.base.name,
            LayerConfig::Activation {
                transform: self.transform,
            },
        )
    }
}
