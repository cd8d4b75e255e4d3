/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : Convolution 层：直接（逐抽头）计算的二维卷积
 *
 * 输入形状`[C, H, W]`，在缓冲区中第`c*H*W + y*W + x`行存放位置(c, y, x)，列为批内样本。
 * 权重布局`[K, C*R*S]`：第k个输出通道、第`c*R*S + r*S + s`列为输入通道c在抽头(r, s)处的权重。
 */

use super::{LayerBase, LayerKind, Leaf};
use crate::backend::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor, ParamMap};
use crate::nn::{Init, Shape};
use ndarray::Array2;

/// 卷积的几何信息（configure时确定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    c: usize,
    h: usize,
    w: usize,
    p: usize,
    q: usize,
}

#[derive(Debug)]
pub struct Convolution {
    base: LayerBase,
    /// (R, S, K)：卷积核高、宽与输出通道数
    fshape: (usize, usize, usize),
    stride: usize,
    padding: usize,
    init: Init,
    /// 冻结的卷积不参与优化（如恒等投影）
    frozen: bool,
    geometry: Option<Geometry>,
    w: Option<Array2<f32>>,
    dw: Option<Array2<f32>>,
}

impl Convolution {
    pub fn new(fshape: (usize, usize, usize), init: Init) -> Self {
        Self {
            base: LayerBase::new("Convolution"),
            fshape,
            stride: 1,
            padding: 0,
            init,
            frozen: false,
            geometry: None,
            w: None,
            dw: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    pub const fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub const fn frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    /// 输出通道数
    pub const fn nofm(&self) -> usize {
        self.fshape.2
    }

    pub const fn stride(&self) -> usize {
        self.stride
    }

    pub const fn padding(&self) -> usize {
        self.padding
    }

    pub const fn fshape(&self) -> (usize, usize, usize) {
        self.fshape
    }

    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub const fn weights(&self) -> Option<&Array2<f32>> {
        self.w.as_ref()
    }

    pub fn set_weights(&mut self, w: Array2<f32>) -> Result<()> {
        if let Some(g) = self.geometry {
            let (r, s, k) = self.fshape;
            let expected = (k, g.c * r * s);
            if w.dim() != expected {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![expected.0, expected.1],
                    got: w.shape().to_vec(),
                    message: format!("{}的权重形状不符", self.base.name),
                });
            }
        }
        self.dw = Some(Array2::zeros(w.dim()));
        self.w = Some(w);
        Ok(())
    }

    /// 前向并按`outputs = conv(x) + beta * outputs`写入（残差投影用beta=1累加）
    pub fn fprop_with_beta(&mut self, x: &Buffer, beta: f32) -> Result<Buffer> {
        self.base.check_input(x)?;
        let out = self.convolve(x)?;
        let outputs = self.base.outputs()?.clone();
        outputs.blend(out.view(), 1.0, beta)?;
        self.base.inputs = Some(x.clone());
        Ok(outputs)
    }

    fn geometry(&self) -> Result<Geometry> {
        self.geometry
            .ok_or_else(|| LayerError::NotConfigured(self.base.name.clone()))
    }

    fn weights_or_err(&self) -> Result<&Array2<f32>> {
        self.w
            .as_ref()
            .ok_or_else(|| LayerError::NotAllocated(self.base.name.clone()))
    }

    /// 遍历所有落在输入范围内的抽头：`f(输出空间位置, 输入行, 权重列)`
    fn for_each_tap(&self, g: Geometry, mut f: impl FnMut(usize, usize, usize)) {
        let (r_len, s_len, _) = self.fshape;
        let pad = self.padding as isize;
        for p in 0..g.p {
            for q in 0..g.q {
                let sp = p * g.q + q;
                for c in 0..g.c {
                    for r in 0..r_len {
                        let y = (p * self.stride + r) as isize - pad;
                        if y < 0 || y >= g.h as isize {
                            continue;
                        }
                        for s in 0..s_len {
                            let x = (q * self.stride + s) as isize - pad;
                            if x < 0 || x >= g.w as isize {
                                continue;
                            }
                            let in_row = c * g.h * g.w + y as usize * g.w + x as usize;
                            let w_col = c * r_len * s_len + r * s_len + s;
                            f(sp, in_row, w_col);
                        }
                    }
                }
            }
        }
    }

    fn convolve(&self, x: &Buffer) -> Result<Array2<f32>> {
        let g = self.geometry()?;
        let w = self.weights_or_err()?;
        let k_len = self.nofm();
        let pq = g.p * g.q;
        let x = x.to_array();
        let mut out = Array2::<f32>::zeros((k_len * pq, x.ncols()));
        self.for_each_tap(g, |sp, in_row, w_col| {
            let xin = x.row(in_row);
            for k in 0..k_len {
                let wk = w[[k, w_col]];
                out.row_mut(k * pq + sp).scaled_add(wk, &xin);
            }
        });
        Ok(out)
    }
}

impl Leaf for Convolution {
    const KIND: LayerKind = LayerKind::Convolution;
    const OWNS_OUTPUT: bool = true;

    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn infer_out_shape(&self, in_shape: &Shape) -> Result<Shape> {
        let [_, h, w] = in_shape.dims() else {
            return Err(LayerError::ShapeMismatch {
                expected: vec![0, 0, 0],
                got: in_shape.dims().to_vec(),
                message: format!("{}的输入须为[C, H, W]三维形状", self.base.name),
            });
        };
        let (r, s, k) = self.fshape;
        let (hp, wp) = (h + 2 * self.padding, w + 2 * self.padding);
        if hp < r || wp < s {
            return Err(LayerError::ShapeMismatch {
                expected: vec![r, s],
                got: vec![hp, wp],
                message: format!("{}的卷积核大于（补零后的）输入", self.base.name),
            });
        }
        let p = (hp - r) / self.stride + 1;
        let q = (wp - s) / self.stride + 1;
        Ok(Shape::new(&[k, p, q]))
    }

    fn allocate_params(&mut self, be: &Backend) -> Result<()> {
        let in_shape = self.base.in_shape()?.clone();
        let out_shape = self.base.out_shape()?.clone();
        let (&[c, h, w], &[_, p, q]) = (in_shape.dims(), out_shape.dims()) else {
            return Err(LayerError::NotConfigured(self.base.name.clone()));
        };
        self.geometry = Some(Geometry { c, h, w, p, q });

        let (r, s, k) = self.fshape;
        let dims = (k, c * r * s);
        if self.w.as_ref().is_none_or(|w| w.dim() != dims) {
            let w = be.with_rng(|rng| self.init.generate(dims.0, dims.1, rng));
            self.dw = Some(Array2::zeros(dims));
            self.w = Some(w);
        }
        Ok(())
    }

    fn forward(&mut self, x: &Buffer, _inference: bool) -> Result<()> {
        self.fprop_with_beta(x, 0.0).map(|_| ())
    }

    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()> {
        let g = self.geometry()?;
        let k_len = self.nofm();
        let pq = g.p * g.q;
        let e = error.to_array();
        let x = self.base.inputs()?.to_array();
        let w = self.weights_or_err()?;

        let mut grad = Array2::<f32>::zeros(x.dim());
        let mut dw = Array2::<f32>::zeros(w.dim());
        self.for_each_tap(g, |sp, in_row, w_col| {
            for k in 0..k_len {
                let ek = e.row(k * pq + sp);
                grad.row_mut(in_row).scaled_add(w[[k, w_col]], &ek);
                dw[[k, w_col]] += ek.dot(&x.row(in_row));
            }
        });

        self.base.write_deltas(grad.view(), alpha, beta)?;
        self.dw = Some(dw);
        Ok(())
    }

    fn trainable(&self) -> bool {
        !self.frozen
    }

    fn params_mut(&mut self) -> Vec<(&mut Array2<f32>, &Array2<f32>)> {
        if self.frozen {
            return Vec::new();
        }
        match (self.w.as_mut(), self.dw.as_ref()) {
            (Some(w), Some(dw)) => vec![(w, dw)],
            _ => Vec::new(),
        }
    }

    fn describe(&self, get_weights: bool) -> LayerDescriptor {
        let mut desc = LayerDescriptor::new(
            LayerKind::Convolution,
            &self.base.name,
            LayerConfig::Convolution {
                fshape: self.fshape,
                stride: self.stride,
                padding: self.padding,
                init: self.init.clone(),
                frozen: self.frozen,
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
            Some(w) => self.set_weights(w.clone()),
            None => Ok(()),
        }
    }
}
