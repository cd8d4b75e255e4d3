/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : 叶子层的公共状态（LayerBase）与叶子层需实现的计算接口（Leaf）
 */

use super::{LayerKind, TraitLayer};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::LayerDescriptor;
use crate::nn::shape::{Link, Shape};
use ndarray::{Array2, ArrayView2};

/// 每个叶子层都有的形状、连接与缓冲区
#[derive(Debug, Clone)]
pub(crate) struct LayerBase {
    pub name: String,
    pub in_shape: Option<Shape>,
    pub out_shape: Option<Shape>,
    pub prev: Option<Link>,
    pub next: Option<Link>,
    /// 输入缓冲区的(行, 列)，allocate时按批宽度确定
    pub in_dims: Option<(usize, usize)>,
    /// 最近一次前向的输入（反向时需要）
    pub inputs: Option<Buffer>,
    pub outputs: Option<Buffer>,
    pub deltas: Option<Buffer>,
}

impl LayerBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_shape: None,
            out_shape: None,
            prev: None,
            next: None,
            in_dims: None,
            inputs: None,
            outputs: None,
            deltas: None,
        }
    }

    /// 记录形状与前驱；形状变化时作废已分配的缓冲区
    pub fn configure(&mut self, in_shape: Shape, out_shape: Shape, prev: Option<Link>) {
        if self.in_shape.as_ref() != Some(&in_shape) || self.out_shape.as_ref() != Some(&out_shape)
        {
            self.in_dims = None;
            self.inputs = None;
            self.outputs = None;
        }
        self.deltas = None;
        tracing::trace!(layer = %self.name, %in_shape, %out_shape, "configure");
        self.in_shape = Some(in_shape);
        self.out_shape = Some(out_shape);
        self.prev = prev;
    }

    pub fn in_shape(&self) -> Result<&Shape> {
        self.in_shape
            .as_ref()
            .ok_or_else(|| LayerError::NotConfigured(self.name.clone()))
    }

    pub fn out_shape(&self) -> Result<&Shape> {
        self.out_shape
            .as_ref()
            .ok_or_else(|| LayerError::NotConfigured(self.name.clone()))
    }

    pub fn bind_dims(&mut self, be: &Backend) -> Result<()> {
        let dims = be.buffer_dims(self.in_shape()?);
        self.in_dims = Some(dims);
        Ok(())
    }

    /// 分配（或别名复用`shared`）输出缓冲区。已有同形状缓冲区且未指定`shared`时保持不变
    pub fn allocate_outputs(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
        let out_shape = self.out_shape()?.clone();
        match (shared, &self.outputs) {
            (None, Some(existing)) if existing.dims() == be.buffer_dims(&out_shape) => {}
            _ => self.outputs = Some(be.iobuf(&out_shape, shared)?),
        }
        Ok(())
    }

    /// 领取梯度缓冲区：
    /// - 前驱是BranchNode：与该BranchNode共用同一块梯度缓冲区；
    /// - 没有前驱（整个拓扑的根）：不需要梯度缓冲区；
    /// - 否则占用池中的当前缓冲区并推进池。
    pub fn take_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
        let in_shape = self.in_shape()?.clone();
        self.deltas = match &self.prev {
            None => None,
            Some(Link::Branch(node)) => {
                let shared = node
                    .deltas()
                    .ok_or_else(|| LayerError::NotAllocated(node.name().to_string()))?;
                Some(be.iobuf(&in_shape, Some(&shared))?)
            }
            Some(Link::Layer { .. }) => {
                let deltas = be.iobuf(&in_shape, Some(pool.current()?))?;
                pool.advance();
                Some(deltas)
            }
        };
        Ok(())
    }

    pub fn check_input(&self, x: &Buffer) -> Result<()> {
        let expected = self
            .in_dims
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))?;
        if x.dims() != expected {
            return Err(LayerError::ShapeMismatch {
                expected: vec![expected.0, expected.1],
                got: vec![x.rows(), x.cols()],
                message: format!("{}的输入缓冲区形状与configure时不符", self.name),
            });
        }
        Ok(())
    }

    pub fn inputs(&self) -> Result<&Buffer> {
        self.inputs.as_ref().ok_or_else(|| {
            LayerError::InvalidInput(format!("{}在反向传播前未执行前向传播", self.name))
        })
    }

    pub fn outputs(&self) -> Result<&Buffer> {
        self.outputs
            .as_ref()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))
    }

    /// `deltas = alpha * grad + beta * deltas`；没有梯度缓冲区（拓扑的根）时什么都不做
    pub fn write_deltas(&self, grad: ArrayView2<'_, f32>, alpha: f32, beta: f32) -> Result<()> {
        match &self.deltas {
            Some(deltas) => deltas.blend(grad, alpha, beta),
            None => Ok(()),
        }
    }
}

/// 叶子层的具体计算。`TraitLayer`的公共部分由`impl_trait_layer_for_leaf!`统一生成
pub(crate) trait Leaf {
    const KIND: LayerKind;
    const OWNS_OUTPUT: bool;

    fn base(&self) -> &LayerBase;

    fn base_mut(&mut self) -> &mut LayerBase;

    fn infer_out_shape(&self, in_shape: &Shape) -> Result<Shape>;

    /// 按已知形状准备参数等额外状态
    fn allocate_params(&mut self, be: &Backend) -> Result<()> {
        let _ = be;
        Ok(())
    }

    /// 前向：读取`x`，写入`base().outputs`（原地层则让outputs就是x）
    fn forward(&mut self, x: &Buffer, inference: bool) -> Result<()>;

    /// 反向：写入梯度缓冲区并累积参数梯度
    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()>;

    fn trainable(&self) -> bool {
        false
    }

    fn params_mut(&mut self) -> Vec<(&mut Array2<f32>, &Array2<f32>)> {
        Vec::new()
    }

    fn describe(&self, get_weights: bool) -> LayerDescriptor;

    fn restore(&mut self, desc: &LayerDescriptor) -> Result<()> {
        let _ = desc;
        Ok(())
    }
}
