/*
 * @Author       : 老董
 * @Date         : 2026-10-10
 * @Description  : 分叉-合并容器：MergeBroadcast（同一输入广播到各子路径）
 *                 与 MergeMultistream（每条子路径各有独立输入）
 *
 * 合并不做任何拷贝：容器只分配一块拼接后的输出缓冲区，按合并方式切成互不重叠的视图，
 * 每条子路径直接把输出写进自己的视图。
 */

use super::{Nest, Sequential, into_sequential, load_children, nested_block};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use crate::nn::layer::{Layer, LayerKind, TraitLayer};
use crate::nn::shape::{Flow, Incoming, Link, Shape, Terminal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

// ==================== MergeMode ====================

/// 子路径输出的拼接方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// 序列`[f, T]`沿时间轴拼接（各子路径特征数须相同）
    Recurrent,
    /// 沿首维（通道）拼接，其余维度须相同
    Depth,
    /// 按元素总数展平后拼接
    Stack,
}

impl MergeMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Recurrent => "recurrent",
            Self::Depth => "depth",
            Self::Stack => "stack",
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recurrent" => Ok(Self::Recurrent),
            "depth" => Ok(Self::Depth),
            "stack" => Ok(Self::Stack),
            other => Err(LayerError::UnsupportedMerge(other.to_string())),
        }
    }
}

/// 拼接后的形状，以及切分所需的每路跨度与步长
#[derive(Debug, Clone, PartialEq)]
struct MergeLayout {
    out_shape: Shape,
    catdims: Vec<usize>,
    /// 步长；`None`表示等于批宽度（recurrent）
    stride: Option<usize>,
}

impl MergeLayout {
    fn new(mode: MergeMode, shapes: &[Shape], who: &str) -> Result<Self> {
        let first = shapes
            .first()
            .ok_or_else(|| LayerError::Structure(format!("{who}没有子路径")))?;
        let mismatch = |got: &Shape, message: &str| LayerError::ShapeMismatch {
            expected: first.dims().to_vec(),
            got: got.dims().to_vec(),
            message: format!("{who}：{message}"),
        };

        match mode {
            MergeMode::Recurrent => {
                let f = match first.dims() {
                    [f, _] => *f,
                    _ => return Err(mismatch(first, "recurrent合并要求子路径输出为[f, T]")),
                };
                let mut catdims = Vec::with_capacity(shapes.len());
                for s in shapes {
                    match s.dims() {
                        [sf, t] if *sf == f => catdims.push(*t),
                        _ => return Err(mismatch(s, "recurrent合并要求各子路径特征数相同")),
                    }
                }
                let total = catdims.iter().sum();
                Ok(Self {
                    out_shape: Shape::new(&[f, total]),
                    catdims,
                    stride: None,
                })
            }
            MergeMode::Depth => {
                let trailing = first.dims().get(1..).unwrap_or_default();
                let mut catdims = Vec::with_capacity(shapes.len());
                for s in shapes {
                    match s.dims().split_first() {
                        Some((c, rest)) if rest == trailing => catdims.push(*c),
                        _ => return Err(mismatch(s, "depth合并要求各子路径除首维外形状相同")),
                    }
                }
                let total: usize = catdims.iter().sum();
                let mut dims = vec![total];
                dims.extend_from_slice(trailing);
                Ok(Self {
                    out_shape: Shape::from(dims),
                    catdims,
                    stride: Some(trailing.iter().product()),
                })
            }
            MergeMode::Stack => {
                let catdims: Vec<usize> = shapes.iter().map(Shape::volume).collect();
                Ok(Self {
                    out_shape: Shape::flat(catdims.iter().sum()),
                    catdims,
                    stride: Some(1),
                })
            }
        }
    }

    /// 各子路径在拼接缓冲区中的起止范围（前缀和 × 步长）
    fn slices(&self, bsz: usize) -> Vec<Range<usize>> {
        let stride = self.stride.unwrap_or(bsz);
        let mut start = 0;
        self.catdims
            .iter()
            .map(|d| {
                let end = start + d * stride;
                let range = start..end;
                start = end;
                range
            })
            .collect()
    }
}

/// 按范围切分拼接缓冲区：列数不等于批宽度时（序列）沿列切，否则沿行切
pub(crate) fn partition(bsz: usize, x: &Buffer, slices: &[Range<usize>]) -> Result<Vec<Buffer>> {
    slices
        .iter()
        .map(|range| {
            if x.cols() != bsz {
                x.slice_cols(range.clone())
            } else {
                x.slice_rows(range.clone())
            }
        })
        .collect()
}

// ==================== MergeCore ====================

/// 两种合并容器共用的状态与逻辑
#[derive(Debug)]
struct MergeCore {
    name: String,
    merge: MergeMode,
    layers: Vec<Sequential>,
    alphas: Vec<f32>,
    betas: Vec<f32>,
    in_shape: Option<Flow<Shape>>,
    layout: Option<MergeLayout>,
    prev: Option<Link>,
    next: Option<Link>,
    /// allocate时的批宽度，切分误差时用
    bsz: Option<usize>,
    slices: Vec<Range<usize>>,
    outputs: Option<Buffer>,
    deltas: Option<Buffer>,
    /// (切分时的误差缓冲区, 各子路径的误差视图)
    error_views: Option<(Buffer, Vec<Buffer>)>,
}

impl MergeCore {
    fn new(name: &str, paths: Vec<Nest>, merge: MergeMode, alphas: Option<Vec<f32>>) -> Result<Self> {
        let layers = paths
            .into_iter()
            .map(into_sequential)
            .collect::<Result<Vec<_>>>()?;
        if layers.is_empty() {
            return Err(LayerError::Structure(format!("{name}至少需要一条子路径")));
        }
        let alphas = alphas.unwrap_or_else(|| vec![1.0; layers.len()]);
        if alphas.len() != layers.len() {
            return Err(LayerError::Structure(format!(
                "{name}有{}条子路径，却给出了{}个alpha",
                layers.len(),
                alphas.len()
            )));
        }
        // 最后一条子路径覆盖写入，其余累加
        let mut betas = vec![1.0; layers.len()];
        if let Some(last) = betas.last_mut() {
            *last = 0.0;
        }

        Ok(Self {
            name: name.to_string(),
            merge,
            layers,
            alphas,
            betas,
            in_shape: None,
            layout: None,
            prev: None,
            next: None,
            bsz: None,
            slices: Vec::new(),
            outputs: None,
            deltas: None,
            error_views: None,
        })
    }

    fn configure_merge(&mut self) -> Result<()> {
        let shapes = self
            .layers
            .iter()
            .map(|l| {
                l.out_shape()
                    .ok_or_else(|| LayerError::NotConfigured(l.name().to_string()))?
                    .one(l.name())
                    .cloned()
            })
            .collect::<Result<Vec<_>>>()?;
        let layout = MergeLayout::new(self.merge, &shapes, &self.name)?;
        if self.layout.as_ref() != Some(&layout) {
            self.outputs = None;
            self.error_views = None;
        }
        tracing::debug!(
            container = %self.name,
            merge = %self.merge,
            out_shape = %layout.out_shape,
            "合并形状推断完成"
        );
        self.layout = Some(layout);
        Ok(())
    }

    fn layout(&self) -> Result<&MergeLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| LayerError::NotConfigured(self.name.clone()))
    }

    fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
        let out_shape = self.layout()?.out_shape.clone();
        let dims = be.buffer_dims(&out_shape);
        let keep = shared.is_none() && self.outputs.as_ref().is_some_and(|o| o.dims() == dims);
        if !keep {
            self.outputs = Some(be.iobuf(&out_shape, shared)?);
        }
        self.bsz = Some(be.bsz());
        self.slices = self.layout()?.slices(be.bsz());

        let outputs = self
            .outputs
            .clone()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))?;
        let views = partition(be.bsz(), &outputs, &self.slices)?;
        for (layer, view) in self.layers.iter_mut().zip(&views) {
            layer.allocate(be, Some(view))?;
        }
        Ok(())
    }

    fn outputs(&self) -> Result<Buffer> {
        self.outputs
            .clone()
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))
    }

    /// 取误差的各子路径视图；同一误差缓冲区只切分一次
    fn error_views(&mut self, error: &Buffer) -> Result<Vec<Buffer>> {
        if let Some((cached, views)) = &self.error_views {
            if cached.same_view(error) {
                return Ok(views.clone());
            }
        }
        let bsz = self
            .bsz
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))?;
        let views = partition(bsz, error, &self.slices)?;
        self.error_views = Some((error.clone(), views.clone()));
        Ok(views)
    }

    fn terminals(&self) -> Result<Flow<Terminal>> {
        // 合并后的输出缓冲区由容器自身持有，代价函数挂接在容器上
        Ok(Flow::One(Terminal {
            name: self.name.clone(),
            out_shape: self.layout()?.out_shape.clone(),
        }))
    }

    fn delta_volume(&self) -> usize {
        let own = self
            .in_shape
            .as_ref()
            .map_or(0, |f| f.iter().map(Shape::volume).max().unwrap_or(0));
        self.layers
            .iter()
            .map(TraitLayer::delta_volume)
            .fold(own, usize::max)
    }

    fn describe(&self, kind: LayerKind, get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(
            kind,
            &self.name,
            LayerConfig::Merge {
                merge: self.merge,
                alphas: self.alphas.clone(),
            },
        )
        .with_layers(
            self.layers
                .iter()
                .map(|l| l.get_description(get_weights))
                .collect(),
        )
    }

    fn load_weights(&mut self, desc: &LayerDescriptor) -> Result<()> {
        let children = self
            .layers
            .iter_mut()
            .map(|l| l as &mut dyn TraitLayer)
            .collect();
        load_children(&self.name, children, desc)
    }

    fn layers_to_optimize(&mut self) -> Vec<&mut Layer> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.layers_to_optimize())
            .collect()
    }

    fn nested_str(&self, kind: LayerKind, level: usize) -> String {
        nested_block(
            kind.as_str(),
            level,
            self.layers.iter().map(|l| l as &dyn TraitLayer),
        )
    }
}

// 两种合并容器中完全相同的那部分`TraitLayer`方法
macro_rules! merge_common {
    ($kind:expr) => {
        fn name(&self) -> &str {
            &self.core.name
        }

        fn kind(&self) -> LayerKind {
            $kind
        }

        fn owns_output(&self) -> bool {
            true
        }

        fn in_shape(&self) -> Option<Flow<Shape>> {
            self.core.in_shape.clone()
        }

        fn out_shape(&self) -> Option<Flow<Shape>> {
            self.core
                .layout
                .as_ref()
                .map(|l| Flow::One(l.out_shape.clone()))
        }

        fn prev(&self) -> Option<Link> {
            self.core.prev.clone()
        }

        fn set_next(&mut self, next: Link) {
            self.core.next = Some(next);
        }

        fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
            self.core.allocate(be, shared)
        }

        fn delta_volume(&self) -> usize {
            self.core.delta_volume()
        }

        fn outputs(&self) -> Option<Flow<Buffer>> {
            self.core.outputs.clone().map(Flow::One)
        }

        fn deltas(&self) -> Option<Buffer> {
            self.core.deltas.clone()
        }

        fn get_terminal(&self) -> Result<Flow<Terminal>> {
            self.core.terminals()
        }

        fn layers_to_optimize(&mut self) -> Vec<&mut Layer> {
            self.core.layers_to_optimize()
        }

        fn get_description(&self, get_weights: bool) -> LayerDescriptor {
            self.core.describe($kind, get_weights)
        }

        fn load_weights(&mut self, desc: &LayerDescriptor) -> Result<()> {
            self.core.load_weights(desc)
        }

        fn nested_str(&self, level: usize) -> String {
            self.core.nested_str($kind, level)
        }
    };
}

// ==================== MergeBroadcast ====================

/// 把同一个输入广播给K条子路径，再把它们的输出拼接成一个缓冲区
#[derive(Debug)]
pub struct MergeBroadcast {
    core: MergeCore,
}

impl MergeBroadcast {
    pub fn new(paths: Vec<Nest>, merge: MergeMode, alphas: Option<Vec<f32>>) -> Result<Self> {
        Ok(Self {
            core: MergeCore::new("MergeBroadcast", paths, merge, alphas)?,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core.name = name.into();
        self
    }

    pub const fn merge(&self) -> MergeMode {
        self.core.merge
    }

    pub fn paths(&self) -> &[Sequential] {
        &self.core.layers
    }

    pub fn alphas(&self) -> &[f32] {
        &self.core.alphas
    }

    pub fn betas(&self) -> &[f32] {
        &self.core.betas
    }

    /// 各子路径在拼接缓冲区中的范围（allocate后可用）
    pub fn slices(&self) -> &[Range<usize>] {
        &self.core.slices
    }

    /// 把拼接缓冲区`x`切成各子路径的视图
    pub fn get_partitions(&self, be: &Backend, x: &Buffer) -> Result<Vec<Buffer>> {
        partition(be.bsz(), x, &self.core.slices)
    }
}

impl TraitLayer for MergeBroadcast {
    merge_common!(LayerKind::MergeBroadcast);

    fn configure(&mut self, input: &Incoming) -> Result<()> {
        self.core.in_shape = Some(input.shape.clone());
        self.core.prev = input.prev.clone();
        for layer in &mut self.core.layers {
            layer.configure(input)?;
        }
        self.core.configure_merge()
    }

    /// 需要4个缓冲区的池：子路径内部交替使用中间两块，
    /// 各子路径的首层共用第一块（即本容器的输入梯度），外层下一个使用者拿到最后一块
    fn set_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
        pool.require(4, &self.core.name)?;
        for layer in &mut self.core.layers {
            layer.allocate_deltas(be, Some(pool.slots(1..3)?))?;
            layer.first_mut().set_deltas(be, &mut pool.slots(0..1)?)?;
        }

        let in_shape = self
            .core
            .in_shape
            .as_ref()
            .ok_or_else(|| LayerError::NotConfigured(self.core.name.clone()))?
            .one(&self.core.name)?
            .clone();
        self.core.deltas = match &self.core.prev {
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
        self.core.error_views = None;
        Ok(())
    }

    /// 作为顶层时自行分配4个缓冲区的池
    fn allocate_deltas(&mut self, be: &Backend, pool: Option<DeltaPool>) -> Result<()> {
        let mut pool = match pool {
            Some(pool) => pool,
            None => DeltaPool::allocate(be, 4, self.core.delta_volume())?,
        };
        self.set_deltas(be, &mut pool)
    }

    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, inference: bool) -> Result<Flow<Buffer>> {
        for layer in &mut self.core.layers {
            layer.fprop(inputs, inference)?;
        }
        Ok(Flow::One(self.core.outputs()?))
    }

    /// 调用方的`beta`只覆盖最后一条子路径（它最先被处理，决定本容器梯度是覆盖还是累加）；
    /// 各子路径按逆序、以`alpha_i * alpha`反向传播
    fn bprop(&mut self, error: &Flow<Buffer>, alpha: f32, beta: f32) -> Result<Option<Buffer>> {
        if let Some(last) = self.core.betas.last_mut() {
            *last = beta;
        }
        let error = error.one(&self.core.name)?;
        let views = self.core.error_views(error)?;

        let core = &mut self.core;
        for (i, layer) in core.layers.iter_mut().enumerate().rev() {
            layer.bprop(&Flow::One(views[i].clone()), core.alphas[i] * alpha, core.betas[i])?;
        }
        Ok(core.deltas.clone())
    }
}

// ==================== MergeMultistream ====================

/// 每条子路径各自接收一路外部输入，输出拼接方式同MergeBroadcast
#[derive(Debug)]
pub struct MergeMultistream {
    core: MergeCore,
}

impl MergeMultistream {
    pub fn new(paths: Vec<Nest>, merge: MergeMode) -> Result<Self> {
        Ok(Self {
            core: MergeCore::new("MergeMultistream", paths, merge, None)?,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core.name = name.into();
        self
    }

    pub const fn merge(&self) -> MergeMode {
        self.core.merge
    }

    pub fn paths(&self) -> &[Sequential] {
        &self.core.layers
    }

    pub fn slices(&self) -> &[Range<usize>] {
        &self.core.slices
    }

    pub fn get_partitions(&self, be: &Backend, x: &Buffer) -> Result<Vec<Buffer>> {
        partition(be.bsz(), x, &self.core.slices)
    }

    fn check_streams(&self, got: usize) -> Result<()> {
        if got != self.core.layers.len() {
            return Err(LayerError::InvalidInput(format!(
                "{}有{}条子路径，却收到{}路输入",
                self.core.name,
                self.core.layers.len(),
                got
            )));
        }
        Ok(())
    }

    /// 子路径之间没有共同的上游梯度，各自独立分配梯度缓冲池
    fn allocate_path_deltas(&mut self, be: &Backend) -> Result<()> {
        for layer in &mut self.core.layers {
            layer.allocate_deltas(be, None)?;
        }
        self.core.error_views = None;
        Ok(())
    }
}

impl TraitLayer for MergeMultistream {
    merge_common!(LayerKind::MergeMultistream);

    /// 须以多路形状configure，每条子路径一路；各路输入没有前驱层
    fn configure(&mut self, input: &Incoming) -> Result<()> {
        let shapes = input.shape.many(&self.core.name)?.to_vec();
        self.check_streams(shapes.len())?;
        self.core.in_shape = Some(input.shape.clone());
        self.core.prev = None;
        for (layer, shape) in self.core.layers.iter_mut().zip(shapes) {
            layer.configure(&Incoming::shape(shape))?;
        }
        self.core.configure_merge()
    }

    fn set_deltas(&mut self, be: &Backend, _pool: &mut DeltaPool) -> Result<()> {
        self.allocate_path_deltas(be)
    }

    fn allocate_deltas(&mut self, be: &Backend, _pool: Option<DeltaPool>) -> Result<()> {
        self.allocate_path_deltas(be)
    }

    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, inference: bool) -> Result<Flow<Buffer>> {
        let streams = inputs
            .ok_or_else(|| LayerError::InvalidInput(format!("{}需要多路输入", self.core.name)))?
            .many(&self.core.name)?;
        self.check_streams(streams.len())?;
        for (layer, x) in self.core.layers.iter_mut().zip(streams) {
            layer.fprop(Some(&Flow::One(x.clone())), inference)?;
        }
        Ok(Flow::One(self.core.outputs()?))
    }

    /// 各子路径的误差互不相干，使用默认的(1, 0)；输入来自外部数据，没有梯度可返回
    fn bprop(&mut self, error: &Flow<Buffer>, _alpha: f32, _beta: f32) -> Result<Option<Buffer>> {
        let error = error.one(&self.core.name)?;
        let views = self.core.error_views(error)?;
        for (layer, e) in self.core.layers.iter_mut().zip(views) {
            layer.bprop(&Flow::One(e), 1.0, 0.0)?;
        }
        Ok(None)
    }
}
