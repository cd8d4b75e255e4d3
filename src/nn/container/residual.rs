/*
 * @Author       : 老董
 * @Date         : 2026-10-10
 * @Description  : ResidualModule：主干 + 跳连（可选1x1投影卷积），两者逐元素相加
 */

use super::{Nest, Sequential, into_sequential, load_children, nested_block};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use crate::nn::layer::{Convolution, Layer, LayerKind, TraitLayer};
use crate::nn::shape::{Flow, Incoming, Link, Shape, Terminal};
use crate::nn::Init;

/// 残差模块
///
/// 投影卷积的输出通道数取主干最后一个卷积的输出通道数，步长取倒数第二个卷积的步长，
/// 因此主干中至少要有两个卷积。`projection`为恒等初始化时，投影照常计算但权重冻结，
/// 不会出现在`layers_to_optimize`中。
#[derive(Debug)]
pub struct ResidualModule {
    name: String,
    trunk: Sequential,
    projection: Option<Init>,
    skip: Option<Box<Layer>>,
    in_shape: Option<Shape>,
    prev: Option<Link>,
    next: Option<Link>,
    outputs: Option<Buffer>,
    deltas: Option<Buffer>,
}

impl ResidualModule {
    pub fn new(layers: impl Into<Nest>, projection: Option<Init>) -> Result<Self> {
        let trunk = into_sequential(layers.into())?;
        let convs: Vec<&Convolution> = trunk
            .layers()
            .iter()
            .filter_map(|l| match l {
                Layer::Convolution(conv) => Some(conv),
                _ => None,
            })
            .collect();
        let [.., second_last, last] = convs.as_slice() else {
            return Err(LayerError::Structure(format!(
                "ResidualModule的主干至少需要两个卷积层，实际只有{}个",
                convs.len()
            )));
        };
        let (nofm, stride) = (last.nofm(), second_last.stride());

        let skip = projection.as_ref().map(|init| {
            Box::new(Layer::from(
                Convolution::new((1, 1, nofm), init.clone())
                    .with_name("ResidualModule_skip")
                    .with_stride(stride)
                    .frozen(init.is_identity()),
            ))
        });

        Ok(Self {
            name: "ResidualModule".to_string(),
            trunk,
            projection,
            skip,
            in_shape: None,
            prev: None,
            next: None,
            outputs: None,
            deltas: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub const fn trunk(&self) -> &Sequential {
        &self.trunk
    }

    pub fn skip(&self) -> Option<&Layer> {
        self.skip.as_deref()
    }

    pub fn skip_mut(&mut self) -> Option<&mut Layer> {
        self.skip.as_deref_mut()
    }

    fn in_shape_or_err(&self) -> Result<&Shape> {
        self.in_shape
            .as_ref()
            .ok_or_else(|| LayerError::NotConfigured(self.name.clone()))
    }

    fn outputs_or_err(&self) -> Result<&Buffer> {
        self.outputs
            .as_ref()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))
    }

    fn trunk_out_shape(&self) -> Result<Shape> {
        self.trunk
            .out_shape()
            .ok_or_else(|| LayerError::NotConfigured(self.trunk.name().to_string()))?
            .one(&self.name)
            .cloned()
    }
}

impl TraitLayer for ResidualModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::ResidualModule
    }

    fn owns_output(&self) -> bool {
        true
    }

    fn in_shape(&self) -> Option<Flow<Shape>> {
        self.in_shape.clone().map(Flow::One)
    }

    fn out_shape(&self) -> Option<Flow<Shape>> {
        self.trunk.out_shape()
    }

    fn prev(&self) -> Option<Link> {
        self.prev.clone()
    }

    fn set_next(&mut self, next: Link) {
        self.trunk.set_next(next.clone());
        self.next = Some(next);
    }

    /// 主干与跳连必须产出相同的形状；无投影时主干输出还必须与输入形状相同
    fn configure(&mut self, input: &Incoming) -> Result<()> {
        let in_shape = input.one_shape(&self.name)?.clone();
        self.trunk.configure(input)?;
        let out_shape = self.trunk_out_shape()?;

        let skip_shape = match self.skip.as_deref_mut() {
            Some(skip) => {
                skip.configure(input)?;
                skip.out_shape()
                    .ok_or_else(|| LayerError::NotConfigured(skip.name().to_string()))?
                    .one(&self.name)?
                    .clone()
            }
            None => in_shape.clone(),
        };
        if skip_shape != out_shape {
            return Err(LayerError::ShapeMismatch {
                expected: out_shape.dims().to_vec(),
                got: skip_shape.dims().to_vec(),
                message: format!("{}的跳连输出须与主干输出形状相同", self.name),
            });
        }

        if self.in_shape.as_ref() != Some(&in_shape) {
            self.outputs = None;
        }
        self.in_shape = Some(in_shape);
        self.prev = input.prev.clone();
        self.deltas = None;
        Ok(())
    }

    /// 主干的最后一个持有输出的层与投影卷积都写入本模块的同一个输出缓冲区
    fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
        let out_shape = self.trunk_out_shape()?;
        let keep = shared.is_none()
            && self
                .outputs
                .as_ref()
                .is_some_and(|o| o.dims() == be.buffer_dims(&out_shape));
        if !keep {
            self.outputs = Some(be.iobuf(&out_shape, shared)?);
        }
        let outputs = self.outputs_or_err()?.clone();
        self.trunk.allocate(be, Some(&outputs))?;
        if let Some(skip) = self.skip.as_deref_mut() {
            skip.allocate(be, Some(&outputs))?;
        }
        Ok(())
    }

    /// 需要4个缓冲区的池：主干内部交替使用中间两块；主干首层、投影卷积与本模块的梯度共用第一块
    fn set_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
        pool.require(4, &self.name)?;
        self.trunk.allocate_deltas(be, Some(pool.slots(1..3)?))?;
        self.trunk.first_mut().set_deltas(be, &mut pool.slots(0..1)?)?;
        if let Some(skip) = self.skip.as_deref_mut() {
            skip.set_deltas(be, &mut pool.slots(0..1)?)?;
        }

        let in_shape = self.in_shape_or_err()?.clone();
        self.deltas = match &self.prev {
            Some(Link::Branch(node)) => {
                let shared = node
                    .deltas()
                    .ok_or_else(|| LayerError::NotAllocated(node.name().to_string()))?;
                Some(be.iobuf(&in_shape, Some(&shared))?)
            }
            _ => {
                let deltas = be.iobuf(&in_shape, Some(pool.current()?))?;
                pool.advance();
                Some(deltas)
            }
        };
        Ok(())
    }

    fn allocate_deltas(&mut self, be: &Backend, pool: Option<DeltaPool>) -> Result<()> {
        let mut pool = match pool {
            Some(pool) => pool,
            None => DeltaPool::allocate(be, 4, self.delta_volume())?,
        };
        self.set_deltas(be, &mut pool)
    }

    fn delta_volume(&self) -> usize {
        let own = self.in_shape.as_ref().map_or(0, Shape::volume);
        let skip = self.skip.as_deref().map_or(0, TraitLayer::delta_volume);
        own.max(skip).max(self.trunk.delta_volume())
    }

    fn outputs(&self) -> Option<Flow<Buffer>> {
        self.outputs.clone().map(Flow::One)
    }

    fn deltas(&self) -> Option<Buffer> {
        self.deltas.clone()
    }

    /// 主干写入输出后，投影卷积以beta=1累加；无投影时直接把输入加到输出上
    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, inference: bool) -> Result<Flow<Buffer>> {
        let x = inputs
            .ok_or_else(|| LayerError::InvalidInput(format!("{}需要输入数据", self.name)))?
            .one(&self.name)?
            .clone();
        self.trunk.fprop(Some(&Flow::One(x.clone())), inference)?;
        let outputs = self.outputs_or_err()?.clone();
        match self.skip.as_deref_mut() {
            Some(Layer::Convolution(conv)) => {
                conv.fprop_with_beta(&x, 1.0)?;
            }
            Some(other) => {
                return Err(LayerError::Structure(format!(
                    "{}的跳连只能是卷积层，实际为{}",
                    self.name,
                    other.kind()
                )));
            }
            None => outputs.add_assign_from(&x)?,
        }
        Ok(Flow::One(outputs))
    }

    /// 跳连先写入梯度（有投影时由投影卷积计算，否则即误差本身），主干再以beta=1累加
    fn bprop(&mut self, error: &Flow<Buffer>, alpha: f32, beta: f32) -> Result<Option<Buffer>> {
        match self.skip.as_deref_mut() {
            Some(skip) => {
                skip.bprop(error, alpha, beta)?;
            }
            None => {
                let e = error.one(&self.name)?;
                if let Some(deltas) = &self.deltas {
                    deltas.blend_from(e, alpha, beta)?;
                }
            }
        }
        self.trunk.bprop(error, alpha, 1.0)?;
        Ok(self.deltas.clone())
    }

    fn get_terminal(&self) -> Result<Flow<Terminal>> {
        self.trunk.get_terminal()
    }

    fn layers_to_optimize(&mut self) -> Vec<&mut Layer> {
        let mut out = self.trunk.layers_to_optimize();
        if let Some(skip) = self.skip.as_deref_mut() {
            if skip.has_params() {
                out.push(skip);
            }
        }
        out
    }

    fn get_description(&self, get_weights: bool) -> LayerDescriptor {
        let mut layers = vec![self.trunk.get_description(get_weights)];
        if let Some(skip) = self.skip.as_deref() {
            layers.push(skip.get_description(get_weights));
        }
        LayerDescriptor::new(
            LayerKind::ResidualModule,
            &self.name,
            LayerConfig::Residual {
                projection: self.projection.clone(),
            },
        )
        .with_layers(layers)
    }

    fn load_weights(&mut self, desc: &LayerDescriptor) -> Result<()> {
        let mut children: Vec<&mut dyn TraitLayer> = vec![&mut self.trunk];
        if let Some(skip) = self.skip.as_deref_mut() {
            children.push(skip);
        }
        load_children(&self.name, children, desc)
    }

    fn nested_str(&self, level: usize) -> String {
        let mut children: Vec<&dyn TraitLayer> = vec![&self.trunk];
        if let Some(skip) = self.skip.as_deref() {
            children.push(skip);
        }
        nested_block(self.kind().as_str(), level, children.into_iter())
    }
}
