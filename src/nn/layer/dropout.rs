/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : Dropout 层：训练时按保留概率随机屏蔽元素，推理时按保留概率缩放（原地）
 */

use super::{LayerBase, LayerKind, Leaf};
use crate::backend::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use crate::nn::Shape;
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use ndarray::Array2;
use rand::Rng;
use rand::rngs::StdRng;

#[derive(Debug)]
pub struct Dropout {
    base: LayerBase,
    keep: f32,
    rng: Option<StdRng>,
    mask: Option<Array2<f32>>,
}

impl Dropout {
    pub fn new(keep: f32) -> Result<Self> {
        if !(keep > 0.0 && keep <= 1.0) {
            return Err(LayerError::InvalidInput(format!(
                "Dropout的保留概率须在(0, 1]内，实际为{keep}"
            )));
        }
        Ok(Self {
            base: LayerBase::new("Dropout"),
            keep,
            rng: None,
            mask: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub const fn keep(&self) -> f32 {
        self.keep
    }
}

impl Leaf for Dropout {
    const KIND: LayerKind = LayerKind::Dropout;
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

    fn allocate_params(&mut self, be: &Backend) -> Result<()> {
        if self.rng.is_none() {
            self.rng = Some(be.fork_rng());
        }
        Ok(())
    }

    fn forward(&mut self, x: &Buffer, inference: bool) -> Result<()> {
        let keep = self.keep;
        if inference {
            x.with_view_mut(|mut v| v.mapv_inplace(|a| a * keep))?;
            self.mask = None;
        } else {
            let rng = self
                .rng
                .as_mut()
                .ok_or_else(|| LayerError::NotAllocated(self.base.name.clone()))?;
            let mask = Array2::from_shape_simple_fn(x.dims(), || {
                if rng.gen_range(0.0f32..1.0) < keep { 1.0 } else { 0.0 }
            });
            x.with_view_mut(|mut v| v *= &mask)?;
            self.mask = Some(mask);
        }
        self.base.inputs = Some(x.clone());
        self.base.outputs = Some(x.clone());
        Ok(())
    }

    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()> {
        let mut grad = error.to_array();
        match &self.mask {
            Some(mask) => grad *= mask,
            None => grad *= self.keep,
        }
        self.base.write_deltas(grad.view(), alpha, beta)
    }

    fn describe(&self, _get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(
            LayerKind::Dropout,
            &self.base.name,
            LayerConfig::Dropout { keep: self.keep },
        )
    }
}
