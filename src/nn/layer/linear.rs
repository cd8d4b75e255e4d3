/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : Linear (全连接) 层：`outputs = W · inputs`
 */

use super::{LayerBase, LayerKind, Leaf};
use crate::backend::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor, ParamMap};
use crate::nn::{Init, Shape};
use ndarray::Array2;

/// Linear (全连接) 层
///
/// # 输入/输出形状
/// - 输入`[nin]`（或任意多维，按元素总数展平） -> 输出`[nout]`
/// - 序列输入`[f, T]` -> 输出`[nout, T]`（逐时间步共用同一组权重）
///
/// 权重布局为`[nout, nin]`，持有自己的输出缓冲区。
#[derive(Debug)]
pub struct Linear {
    base: LayerBase,
    nout: usize,
    init: Init,
    w: Option<Array2<f32>>,
    dw: Option<Array2<f32>>,
}

impl Linear {
    pub fn new(nout: usize, init: Init) -> Self {
        Self {
            base: LayerBase::new("Linear"),
            nout,
            init,
            w: None,
            dw: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub const fn nout(&self) -> usize {
        self.nout
    }

    pub const fn weights(&self) -> Option<&Array2<f32>> {
        self.w.as_ref()
    }

    /// 直接设置权重（形状须与configure推断的一致）
    pub fn set_weights(&mut self, w: Array2<f32>) -> Result<()> {
        let nin = self.nin()?;
        if w.dim() != (self.nout, nin) {
            return Err(LayerError::ShapeMismatch {
                expected: vec![self.nout, nin],
                got: w.shape().to_vec(),
                message: format!("{}的权重形状不符", self.base.name),
            });
        }
        self.dw = Some(Array2::zeros(w.dim()));
        self.w = Some(w);
        Ok(())
    }

    fn nin(&self) -> Result<usize> {
        let in_shape = self.base.in_shape()?;
        Ok(match in_shape.dims() {
            [f, _] => *f,
            _ => in_shape.volume(),
        })
    }

    fn weights_or_err(&self) -> Result<&Array2<f32>> {
        self.w
            .as_ref()
            .ok_or_else(|| LayerError::NotAllocated(self.base.name.clone()))
    }
}

impl Leaf for Linear {
    const KIND: LayerKind = LayerKind::Linear;
    const OWNS_OUTPUT: bool = true;

    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn infer_out_shape(&self, in_shape: &Shape) -> Result<Shape> {
        Ok(match in_shape.dims() {
            [_, t] => Shape::new(&[self.nout, *t]),
            _ => Shape::flat(self.nout),
        })
    }

    fn allocate_params(&mut self, be: &Backend) -> Result<()> {
        let nin = self.nin()?;
        let fits = self.w.as_ref().is_some_and(|w| w.dim() == (self.nout, nin));
        if !fits {
            let w = be.with_rng(|rng| self.init.generate(self.nout, nin, rng));
            self.dw = Some(Array2::zeros(w.dim()));
            self.w = Some(w);
        }
        Ok(())
    }

    fn forward(&mut self, x: &Buffer, _inference: bool) -> Result<()> {
        let out = {
            let w = self.weights_or_err()?;
            x.with_view(|v| w.dot(&v))?
        };
        self.base.outputs()?.assign(out.view())?;
        self.base.inputs = Some(x.clone());
        Ok(())
    }

    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()> {
        let e = error.to_array();
        let x = self.base.inputs()?.to_array();
        let w = self.weights_or_err()?;
        let grad = w.t().dot(&e);
        self.base.write_deltas(grad.view(), alpha, beta)?;
        self.dw = Some(e.dot(&x.t()));
        Ok(())
    }

    fn trainable(&self) -> bool {
        true
    }

    fn params_mut(&mut self) -> Vec<(&mut Array2<f32>, &Array2<f32>)> {
        match (self.w.as_mut(), self.dw.as_ref()) {
            (Some(w), Some(dw)) => vec![(w, dw)],
            _ => Vec::new(),
        }
    }

    fn describe(&self, get_weights: bool) -> LayerDescriptor {
        let mut desc = LayerDescriptor::new(
            LayerKind::Linear,
            &self.base.name,
            LayerConfig::Linear {
                nout: self.nout,
                init: self.init.clone(),
            },
        );
        if get_weights {
            desc.params = self
                .w
                .as_ref()
                .map(|w| ParamMap::from([("W".to_string(), w.clone())]));
        }
        desc
    }

    fn restore(&mut self, desc: &LayerDescriptor) -> Result<()> {
        match desc.param("W") {
            Some(w) if self.base.in_shape.is_some() => self.set_weights(w.clone()),
            Some(w) => {
                self.dw = Some(Array2::zeros(w.dim()));
                self.w = Some(w.clone());
                Ok(())
            }
            None => Ok(()),
        }
    }
}
