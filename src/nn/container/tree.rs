/*
 * @Author       : 老董
 * @Date         : 2026-10-10
 * @Description  : Tree：一条主干 + 若干从BranchNode分出的辅助分支
 *
 * 反向传播时各分支按逆序处理。汇合到同一个BranchNode的多个分支中，
 * 最靠后的那个以beta=0初始化该BranchNode的梯度缓冲区，其余（包括主干）以beta=1累加。
 */

use super::{Nest, Sequential, into_sequential, load_children, nested_block};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use crate::nn::layer::{Layer, LayerKind, TraitLayer};
use crate::nn::shape::{Flow, Incoming, Link, Shape, Terminal};

#[derive(Debug)]
pub struct Tree {
    name: String,
    /// 第0个是主干，其余为辅助分支
    layers: Vec<Sequential>,
    alphas: Vec<f32>,
    betas: Vec<f32>,
}

impl Tree {
    /// `branches`按“主干在前，辅助分支按其BranchNode出现的先后”排列；
    /// `alphas`为各分支反向误差的权重，缺省全为1
    pub fn new(branches: Vec<Nest>, alphas: Option<Vec<f32>>) -> Result<Self> {
        let layers = branches
            .into_iter()
            .map(into_sequential)
            .collect::<Result<Vec<_>>>()?;
        if layers.is_empty() {
            return Err(LayerError::Structure("Tree至少需要一条主干".into()));
        }
        if let Some((i, aux)) = layers
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, b)| b.root_branch().is_none())
        {
            let first = &aux.layers()[0];
            return Err(LayerError::Structure(format!(
                "Tree的第{}个分支必须以BranchNode开头，实际以{}（{}）开头",
                i,
                first.name(),
                first.kind()
            )));
        }

        let alphas = alphas.unwrap_or_else(|| vec![1.0; layers.len()]);
        if alphas.len() != layers.len() {
            return Err(LayerError::Structure(format!(
                "Tree有{}个分支，却给出了{}个alpha",
                layers.len(),
                alphas.len()
            )));
        }
        let betas = Self::compute_betas(&layers);

        Ok(Self {
            name: "Tree".to_string(),
            layers,
            alphas,
            betas,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 逆序扫描：以BranchNode为根、且其后没有同根分支的分支取0，其余取1（主干恒为1）
    fn compute_betas(layers: &[Sequential]) -> Vec<f32> {
        let mut betas = vec![1.0; layers.len()];
        for (i, branch) in layers.iter().enumerate().rev() {
            let Some(root) = branch.root_branch() else {
                continue;
            };
            let initialized_later = layers[i + 1..]
                .iter()
                .any(|later| later.root_branch().is_some_and(|r| r.is_same(root)));
            if i > 0 && !initialized_later {
                betas[i] = 0.0;
            }
        }
        betas
    }

    pub fn branches(&self) -> &[Sequential] {
        &self.layers
    }

    pub fn branches_mut(&mut self) -> &mut [Sequential] {
        &mut self.layers
    }

    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    pub fn betas(&self) -> &[f32] {
        &self.betas
    }

    fn trunk(&self) -> &Sequential {
        &self.layers[0]
    }
}

impl TraitLayer for Tree {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Tree
    }

    fn owns_output(&self) -> bool {
        true
    }

    fn in_shape(&self) -> Option<Flow<Shape>> {
        self.trunk().in_shape()
    }

    fn out_shape(&self) -> Option<Flow<Shape>> {
        self.layers
            .iter()
            .map(|b| b.out_shape().and_then(|s| s.one(b.name()).ok().cloned()))
            .collect::<Option<Vec<_>>>()
            .map(Flow::Many)
    }

    fn prev(&self) -> Option<Link> {
        self.trunk().prev()
    }

    fn set_next(&mut self, _next: Link) {}

    /// 主干以真实输入configure；辅助分支随后从各自已configure的根BranchNode取形状
    fn configure(&mut self, input: &Incoming) -> Result<()> {
        let (trunk, aux) = self.layers.split_at_mut(1);
        trunk[0].configure(input)?;
        for branch in aux {
            branch.configure_from_root()?;
        }
        tracing::debug!(tree = %self.name, branches = self.layers.len(), "Tree configure完成");
        Ok(())
    }

    fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
        if shared.is_some() {
            return Err(LayerError::Structure(format!(
                "{}必须是最外层容器，不能写入外部共享缓冲区",
                self.name
            )));
        }
        for branch in &mut self.layers {
            branch.allocate(be, None)?;
        }
        Ok(())
    }

    fn set_deltas(&mut self, _be: &Backend, _pool: &mut DeltaPool) -> Result<()> {
        Err(LayerError::Structure(format!(
            "{}必须是最外层容器，不能从外部领取梯度缓冲区",
            self.name
        )))
    }

    /// 逆序为每个分支单独分配梯度缓冲池，使最靠后的分支先占用BranchNode的梯度缓冲区
    fn allocate_deltas(&mut self, be: &Backend, pool: Option<DeltaPool>) -> Result<()> {
        if pool.is_some() {
            return Err(LayerError::Structure(format!(
                "{}必须是最外层容器，各分支自行分配梯度缓冲池",
                self.name
            )));
        }
        for branch in self.layers.iter_mut().rev() {
            branch.allocate_deltas(be, None)?;
        }
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
        self.layers
            .iter()
            .map(|b| b.outputs().and_then(|o| o.one(b.name()).ok().cloned()))
            .collect::<Option<Vec<_>>>()
            .map(Flow::Many)
    }

    fn deltas(&self) -> Option<Buffer> {
        self.trunk().deltas()
    }

    /// 推理时只返回主干输出；训练时返回全部分支的输出（与分支顺序一致）
    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, inference: bool) -> Result<Flow<Buffer>> {
        let (trunk, aux) = self.layers.split_at_mut(1);
        let x = trunk[0].fprop(inputs, inference)?;
        if inference {
            return Ok(x);
        }
        let mut outputs = vec![x.one(trunk[0].name())?.clone()];
        for branch in aux {
            let y = branch.fprop(None, inference)?;
            outputs.push(y.one(branch.name())?.clone());
        }
        Ok(Flow::Many(outputs))
    }

    /// `error`须为每个分支一个误差；各分支按逆序、以各自的alpha/beta反向传播
    fn bprop(&mut self, error: &Flow<Buffer>, _alpha: f32, _beta: f32) -> Result<Option<Buffer>> {
        let errors = error.many(&self.name)?;
        if errors.len() != self.layers.len() {
            return Err(LayerError::InvalidInput(format!(
                "{}有{}个分支，却收到{}个误差",
                self.name,
                self.layers.len(),
                errors.len()
            )));
        }
        let mut trunk_deltas = None;
        for (i, branch) in self.layers.iter_mut().enumerate().rev() {
            let deltas = branch.bprop(&Flow::One(errors[i].clone()), self.alphas[i], self.betas[i])?;
            if i == 0 {
                trunk_deltas = deltas;
            }
        }
        Ok(trunk_deltas)
    }

    fn get_terminal(&self) -> Result<Flow<Terminal>> {
        let terminals = self
            .layers
            .iter()
            .map(|b| b.get_terminal()?.one(b.name()).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Flow::Many(terminals))
    }

    fn layers_to_optimize(&mut self) -> Vec<&mut Layer> {
        let mut out = Vec::new();
        for branch in &mut self.layers {
            out.extend(branch.layers_to_optimize());
        }
        out
    }

    fn get_description(&self, get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(
            LayerKind::Tree,
            &self.name,
            LayerConfig::Tree {
                alphas: self.alphas.clone(),
            },
        )
        .with_layers(
            self.layers
                .iter()
                .map(|b| b.get_description(get_weights))
                .collect(),
        )
    }

    fn load_weights(&mut self, desc: &LayerDescriptor) -> Result<()> {
        let children = self
            .layers
            .iter_mut()
            .map(|b| b as &mut dyn TraitLayer)
            .collect();
        load_children(&self.name, children, desc)
    }

    fn nested_str(&self, level: usize) -> String {
        nested_block(
            self.kind().as_str(),
            level,
            self.layers.iter().map(|b| b as &dyn TraitLayer),
        )
    }
}
