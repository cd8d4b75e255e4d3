/*
 * @Author       : 老董
 * @Date         : 2026-10-10
 * @Description  : Sequential：把任意嵌套的层列表展平为一条线性链
 */

use super::{Nest, collect_trainable, load_children, nested_block};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use crate::nn::layer::{Layer, LayerKind, TraitLayer};
use crate::nn::shape::{Flow, Incoming, Link, Shape, Terminal};

/// 线性链
///
/// `layers`保存展平后的全部层（含BranchNode），传播时只走不含BranchNode的那部分
/// （BranchNode只在前向时缓存激活、在反向时作为梯度汇合点被别名引用）。
#[derive(Debug)]
pub struct Sequential {
    name: String,
    layers: Vec<Layer>,
    /// 非BranchNode层在`layers`中的下标
    propagating: Vec<usize>,
    in_shape: Option<Flow<Shape>>,
    prev: Option<Link>,
    next: Option<Link>,
    /// 作为顶层时自己持有的梯度缓冲池
    pool: Option<DeltaPool>,
}

impl Sequential {
    /// 展平`layers`并校验链首：第一个非BranchNode层必须持有输出，或是可作链首的直通变换
    pub fn new(layers: impl Into<Nest>) -> Result<Self> {
        let layers = layers.into().flatten();
        let propagating: Vec<usize> = layers
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_branch_node())
            .map(|(i, _)| i)
            .collect();

        let root = propagating
            .first()
            .map(|&i| &layers[i])
            .ok_or_else(|| LayerError::Structure("Sequential至少需要一个非BranchNode层".into()))?;
        if !(root.owns_output() || root.kind().is_pass_through()) {
            return Err(LayerError::Structure(format!(
                "Sequential的链首{}（{}）必须持有自己的输出",
                root.name(),
                root.kind()
            )));
        }

        Ok(Self {
            name: "Sequential".to_string(),
            layers,
            propagating,
            in_shape: None,
            prev: None,
            next: None,
            pool: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 展平后的全部层（含BranchNode）
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    /// 参与传播的层（不含BranchNode）
    pub fn propagating(&self) -> impl Iterator<Item = &Layer> {
        self.propagating.iter().map(|&i| &self.layers[i])
    }

    /// 链的第一个层（可能是BranchNode）
    pub(crate) fn first_mut(&mut self) -> &mut Layer {
        &mut self.layers[0]
    }

    /// 以BranchNode开头的分支的根节点
    pub fn root_branch(&self) -> Option<&crate::nn::BranchNode> {
        self.layers.first().and_then(Layer::as_branch_node)
    }

    /// 梯度缓冲池（仅在作为顶层分配过时存在）
    pub const fn pool(&self) -> Option<&DeltaPool> {
        self.pool.as_ref()
    }

    fn root(&self) -> &Layer {
        &self.layers[self.propagating[0]]
    }

    fn last(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    /// 从`start`开始依次configure，并把相邻层连起来
    fn configure_chain(&mut self, start: usize, mut input: Incoming) -> Result<()> {
        for i in start..self.layers.len() {
            self.layers[i].configure(&input)?;
            if i > start {
                let link = self.layers[i].link();
                self.layers[i - 1].set_next(link);
            }
            input = Incoming::after(&self.layers[i])?;
        }
        tracing::debug!(
            container = %self.name,
            out_shape = ?self.last().out_shape(),
            "Sequential configure完成"
        );
        Ok(())
    }

    /// 辅助分支的configure：没有外部输入，形状取自（已在前面分支中configure过的）根BranchNode
    pub(crate) fn configure_from_root(&mut self) -> Result<()> {
        let root = self.root_branch().ok_or_else(|| {
            LayerError::Structure(format!("辅助分支{}必须以BranchNode开头", self.name))
        })?;
        let input = Incoming::after(root).map_err(|_| {
            LayerError::Structure(format!(
                "辅助分支{}的根{}尚未在之前的分支中configure",
                self.name,
                root.name()
            ))
        })?;
        let link = root.link();
        self.in_shape = Some(input.shape.clone());
        self.prev = Some(link);
        self.configure_chain(1, input)
    }

    /// 依次把池分发给每个层（含BranchNode与链首）
    fn distribute(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
        for layer in &mut self.layers {
            layer.set_deltas(be, pool)?;
        }
        Ok(())
    }

    fn pool_size(&self) -> usize {
        if self.layers.iter().any(|l| l.kind().needs_extra_deltas()) {
            4
        } else {
            2
        }
    }

    /// 池中每个缓冲区的容量：链首之后各层（及链首容器内部）所需的最大输入元素数
    fn pool_volume(&self) -> usize {
        let head = self
            .layers
            .first()
            .filter(|l| l.kind().is_container())
            .map_or(0, |l| l.delta_volume());
        self.layers
            .iter()
            .skip(1)
            .map(TraitLayer::delta_volume)
            .fold(head, usize::max)
    }
}

impl TraitLayer for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Sequential
    }

    fn owns_output(&self) -> bool {
        true
    }

    fn in_shape(&self) -> Option<Flow<Shape>> {
        self.in_shape.clone()
    }

    fn out_shape(&self) -> Option<Flow<Shape>> {
        self.last().out_shape()
    }

    fn prev(&self) -> Option<Link> {
        self.prev.clone()
    }

    fn set_next(&mut self, next: Link) {
        if let Some(last) = self.layers.last_mut() {
            last.set_next(next.clone());
        }
        self.next = Some(next);
    }

    fn configure(&mut self, input: &Incoming) -> Result<()> {
        self.in_shape = Some(input.shape.clone());
        self.prev = input.prev.clone();
        self.configure_chain(0, input.clone())
    }

    /// 最后一个持有输出的层写入`shared`（若给出），然后每个层各自完成分配
    fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
        if let Some(i) = self.layers.iter().rposition(TraitLayer::owns_output) {
            self.layers[i].allocate(be, shared)?;
        }
        for layer in &mut self.layers {
            layer.allocate(be, None)?;
        }
        Ok(())
    }

    fn set_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
        self.distribute(be, pool)
    }

    fn allocate_deltas(&mut self, be: &Backend, pool: Option<DeltaPool>) -> Result<()> {
        let mut pool = match pool {
            Some(pool) => pool,
            None => {
                let volume = self.pool_volume();
                if volume == 0 {
                    DeltaPool::from_buffers(Vec::new())
                } else {
                    DeltaPool::allocate(be, self.pool_size(), volume)?
                }
            }
        };
        tracing::debug!(container = %self.name, pool = pool.len(), "分发梯度缓冲池");
        self.distribute(be, &mut pool)?;
        self.pool = Some(pool);
        Ok(())
    }

    fn delta_volume(&self) -> usize {
        self.layers
            .iter()
            .map(TraitLayer::delta_volume)
            .max()
            .unwrap_or(0)
    }

    fn outputs(&self) -> Option<Flow<Buffer>> {
        self.last().outputs()
    }

    fn deltas(&self) -> Option<Buffer> {
        self.root().deltas()
    }

    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, inference: bool) -> Result<Flow<Buffer>> {
        let mut x = inputs.cloned();
        for layer in &mut self.layers {
            x = Some(layer.fprop(x.as_ref(), inference)?);
        }
        x.ok_or_else(|| LayerError::Structure(format!("{}没有任何层", self.name)))
    }

    /// 反向遍历传播层：链首、以及前驱为BranchNode的层（汇合点）使用调用方的alpha/beta，
    /// 其余层独占自己的梯度缓冲区，使用默认的(1, 0)
    fn bprop(&mut self, error: &Flow<Buffer>, alpha: f32, beta: f32) -> Result<Option<Buffer>> {
        let first = self.propagating[0];
        let mut error = error.clone();
        for &i in self.propagating.iter().rev() {
            let layer = &mut self.layers[i];
            let at_junction = i == first || matches!(layer.prev(), Some(Link::Branch(_)));
            let (a, b) = if at_junction { (alpha, beta) } else { (1.0, 0.0) };
            let deltas = layer.bprop(&error, a, b)?;
            if i != first {
                let deltas = deltas.ok_or_else(|| LayerError::NotAllocated(layer.name().to_string()))?;
                error = Flow::One(deltas);
            }
        }
        Ok(self.root().deltas())
    }

    fn get_terminal(&self) -> Result<Flow<Terminal>> {
        self.last().get_terminal()
    }

    fn layers_to_optimize(&mut self) -> Vec<&mut Layer> {
        collect_trainable(self.layers.iter_mut())
    }

    fn get_description(&self, get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(LayerKind::Sequential, &self.name, LayerConfig::None).with_layers(
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

    fn nested_str(&self, level: usize) -> String {
        nested_block(
            self.kind().as_str(),
            level,
            self.layers.iter().map(|l| l as &dyn TraitLayer),
        )
    }
}
