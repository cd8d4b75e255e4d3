/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : Bias 层：按特征（或通道）加偏置，原地写入
 */

use super::{LayerBase, LayerKind, Leaf};
use crate::backend::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor, ParamMap};
use crate::nn::{Init, Shape};
use ndarray::{Array2, Axis};

/// 偏置个数等于输入形状的首维：`[n]`为n个、`[f, T]`为f个、`[C, H, W]`为C个（逐通道共享）
#[derive(Debug)]
pub struct Bias {
    base: LayerBase,
    init: Init,
    b: Option<Array2<f32>>,
    db: Option<Array2<f32>>,
}

impl Bias {
    pub fn new(init: Init) -> Self {
        Self {
            base: LayerBase::new("Bias"),
            init,
            b: None,
            db: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub const fn bias(&self) -> Option<&Array2<f32>> {
        self.b.as_ref()
    }

    fn nbias(&self) -> Result<usize> {
        Ok(self.base.in_shape()?.dims().first().copied().unwrap_or(1))
    }

    /// 缓冲区中每个偏置覆盖的连续行数
    fn group(&self) -> Result<usize> {
        let (rows, _) = self
            .base
            .in_dims
            .ok_or_else(|| LayerError::NotAllocated(self.base.name.clone()))?;
        Ok(rows / self.nbias()?.max(1))
    }
}

impl Leaf for Bias {
    const KIND: LayerKind = LayerKind::Bias;
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
        let n = self.nbias()?;
        if self.b.as_ref().is_none_or(|b| b.dim() != (n, 1)) {
            let b = be.with_rng(|rng| self.init.generate(n, 1, rng));
            self.db = Some(Array2::zeros((n, 1)));
            self.b = Some(b);
        }
        Ok(())
    }

    fn forward(&mut self, x: &Buffer, _inference: bool) -> Result<()> {
        let group = self.group()?;
        let b = self
            .b
            .as_ref()
            .ok_or_else(|| LayerError::NotAllocated(self.base.name.clone()))?;
        x.with_view_mut(|mut v| {
            for (r, mut row) in v.axis_iter_mut(Axis(0)).enumerate() {
                let bias = b[[r / group, 0]];
                row.mapv_inplace(|a| a + bias);
            }
        })?;
        self.base.inputs = Some(x.clone());
        self.base.outputs = Some(x.clone());
        Ok(())
    }

    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()> {
        let group = self.group()?;
        let e = error.to_array();
        let row_sums = e.sum_axis(Axis(1));
        let mut db = Array2::zeros((self.nbias()?, 1));
        for (r, s) in row_sums.iter().enumerate() {
            db[[r / group, 0]] += *s;
        }
        self.db = Some(db);
        self.base.write_deltas(e.view(), alpha, beta)
    }

    fn trainable(&self) -> bool {
        true
    }

    fn params_mut(&mut self) -> Vec<(&mut Array2<f32>, &Array2<f32>)> {
        match (self.b.as_mut(), self.db.as_ref()) {
            (Some(b), Some(db)) => vec![(b, db)],
            _ => Vec::new(),
        }
    }

    fn describe(&self, get_weights: bool) -> LayerDescriptor {
        let mut desc = LayerDescriptor::new(
            LayerKind::Bias,
            &self.base.name,
            LayerConfig::Bias {
                init: self.init.clone(),
            },
        );
        if get_weights {
            desc.params = self
                .b
                .as_ref()
                .map(|b| ParamMap::from([("b".to_string(), b.clone())]));
        }
        desc
    }

    fn restore(&mut self, desc: &LayerDescriptor) -> Result<()> {
        if let Some(b) = desc.param("b") {
            self.db = Some(Array2::zeros(b.dim()));
            self.b = Some(b.clone());
        }
        Ok(())
    }
}
