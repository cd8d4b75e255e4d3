/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : 层（Layer）：统一的传播接口 + 封闭的层类型枚举
 *
 * 叶子层（Linear/Conv等）与容器（Sequential/Tree等）对外暴露同一套接口，
 * 因而可以任意嵌套。层类型集合是封闭的（`Layer`枚举），从描述符重建时按`LayerKind`静态分派。
 */

mod activation;
mod base;
mod bias;
mod branch_node;
mod convolution;
mod data_transform;
mod dropout;
mod linear;

pub use activation::{Activation, Transform};
pub use bias::Bias;
pub use branch_node::BranchNode;
pub use convolution::Convolution;
pub use data_transform::DataTransform;
pub use dropout::Dropout;
pub use linear::Linear;

pub(crate) use base::{Leaf, LayerBase};

use super::container::{MergeBroadcast, MergeMultistream, ResidualModule, Sequential, Tree};
use super::descriptor::LayerDescriptor;
use super::shape::{Flow, Incoming, Link, Shape, Terminal};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use enum_dispatch::enum_dispatch;
use ndarray::Array2;
use std::fmt;
use std::str::FromStr;

// ==================== LayerKind ====================

/// 层类型标签，同时充当从描述符重建时的静态注册表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    BranchNode,
    Linear,
    Bias,
    Activation,
    Convolution,
    DataTransform,
    Dropout,
    Sequential,
    Tree,
    MergeBroadcast,
    MergeMultistream,
    ResidualModule,
}

impl LayerKind {
    pub const ALL: [Self; 12] = [
        Self::BranchNode,
        Self::Linear,
        Self::Bias,
        Self::Activation,
        Self::Convolution,
        Self::DataTransform,
        Self::Dropout,
        Self::Sequential,
        Self::Tree,
        Self::MergeBroadcast,
        Self::MergeMultistream,
        Self::ResidualModule,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BranchNode => "BranchNode",
            Self::Linear => "Linear",
            Self::Bias => "Bias",
            Self::Activation => "Activation",
            Self::Convolution => "Convolution",
            Self::DataTransform => "DataTransform",
            Self::Dropout => "Dropout",
            Self::Sequential => "Sequential",
            Self::Tree => "Tree",
            Self::MergeBroadcast => "MergeBroadcast",
            Self::MergeMultistream => "MergeMultistream",
            Self::ResidualModule => "ResidualModule",
        }
    }

    pub const fn is_container(&self) -> bool {
        matches!(
            self,
            Self::Sequential
                | Self::Tree
                | Self::MergeBroadcast
                | Self::MergeMultistream
                | Self::ResidualModule
        )
    }

    /// 需要4个梯度缓冲区（分支内累加 + 主干累加同时存活）的容器
    pub const fn needs_extra_deltas(&self) -> bool {
        matches!(self, Self::MergeBroadcast | Self::ResidualModule)
    }

    /// 不持有输出、但仍可作为链首的直通变换
    pub const fn is_pass_through(&self) -> bool {
        matches!(self, Self::DataTransform | Self::Dropout)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        // 兼容带模块路径的写法，如`layers.container.Tree`
        let short = s.rsplit('.').next().unwrap_or(s);
        Self::ALL
            .iter()
            .find(|k| k.as_str() == short)
            .copied()
            .ok_or_else(|| LayerError::UnknownLayerType(s.to_string()))
    }
}

// ==================== Layer ====================

#[enum_dispatch]
#[derive(Debug)]
pub enum Layer {
    BranchNode,
    Linear,
    Bias,
    Activation,
    Convolution,
    DataTransform,
    Dropout,
    Sequential,
    Tree,
    MergeBroadcast,
    MergeMultistream,
    ResidualModule,
}

/// 所有层（叶子与容器）共同的传播接口
///
/// 生命周期：构造（结构固定）-> `configure`（每种输入形状一次）-> `allocate` +
/// `allocate_deltas`（每次configure后一次）-> 反复`fprop`/`bprop`。
/// 调用顺序不对时返回`NotConfigured`/`NotAllocated`。
#[enum_dispatch(Layer)]
pub trait TraitLayer {
    fn name(&self) -> &str;

    fn kind(&self) -> LayerKind;

    /// 是否持有自己的输出缓冲区（否则原地写入前驱的输出）
    fn owns_output(&self) -> bool;

    /// 是否含可训练参数（容器恒为false，其参数由`layers_to_optimize`递归收集）
    fn has_params(&self) -> bool {
        false
    }

    fn in_shape(&self) -> Option<Flow<Shape>>;

    fn out_shape(&self) -> Option<Flow<Shape>>;

    fn prev(&self) -> Option<Link>;

    fn set_next(&mut self, next: Link);

    /// 本层作为后继的前驱时的连接信息
    fn link(&self) -> Link {
        Link::Layer {
            name: self.name().to_string(),
            kind: self.kind(),
        }
    }

    /// 推断形状并记录前驱
    fn configure(&mut self, input: &Incoming) -> Result<()>;

    /// 分配输出缓冲区；`shared`非空时直接写入调用方给出的视图
    fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()>;

    /// 从梯度缓冲池领取本层的梯度缓冲区
    fn set_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()>;

    /// 作为顶层时分配梯度缓冲池并分发给子层；叶子层无事可做
    fn allocate_deltas(&mut self, be: &Backend, pool: Option<DeltaPool>) -> Result<()> {
        let _ = (be, pool);
        Ok(())
    }

    /// 本层（含嵌套子层）向共享梯度缓冲池索取的最大单样本元素数
    fn delta_volume(&self) -> usize;

    fn outputs(&self) -> Option<Flow<Buffer>>;

    fn deltas(&self) -> Option<Buffer>;

    /// 前向传播。`inputs`为`None`仅对以BranchNode为根的分支有意义（从其缓存的激活取值）
    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, inference: bool) -> Result<Flow<Buffer>>;

    /// 反向传播：`alpha`缩放传入误差，`beta`决定覆盖（0）还是累加（1）到梯度缓冲区
    fn bprop(&mut self, error: &Flow<Buffer>, alpha: f32, beta: f32) -> Result<Option<Buffer>>;

    fn get_terminal(&self) -> Result<Flow<Terminal>>;

    /// 深度优先收集所有含可训练参数的叶子层
    fn layers_to_optimize(&mut self) -> Vec<&mut Layer> {
        Vec::new()
    }

    /// (参数, 梯度)对，供优化器使用
    fn get_params(&mut self) -> Vec<(&mut Array2<f32>, &Array2<f32>)> {
        Vec::new()
    }

    fn get_description(&self, get_weights: bool) -> LayerDescriptor;

    fn load_weights(&mut self, desc: &LayerDescriptor) -> Result<()>;

    /// 缩进的层级结构，每层一行：`类型(名字)`
    fn nested_str(&self, level: usize) -> String {
        format!("{}{}({})", "  ".repeat(level), self.kind(), self.name())
    }

    /// configure -> allocate -> allocate_deltas 一步到位
    fn initialize(&mut self, be: &Backend, input: &Incoming) -> Result<()> {
        self.configure(input)?;
        self.allocate(be, None)?;
        self.allocate_deltas(be, None)
    }
}

impl Layer {
    pub fn as_branch_node(&self) -> Option<&BranchNode> {
        match self {
            Self::BranchNode(node) => Some(node),
            _ => None,
        }
    }

    pub fn is_branch_node(&self) -> bool {
        matches!(self, Self::BranchNode(_))
    }
}

/// 取出单路输入（`None`或多路都会报错）
pub(crate) fn single_input(inputs: Option<&Flow<Buffer>>, who: &str) -> Result<Buffer> {
    inputs
        .ok_or_else(|| LayerError::InvalidInput(format!("{who}需要输入数据")))?
        .one(who)
        .cloned()
}

// 为叶子层统一实现`TraitLayer`，具体计算由各自的`Leaf`实现提供
macro_rules! impl_trait_layer_for_leaf {
    ($($leaf:ty),* $(,)?) => {$(
        impl TraitLayer for $leaf {
            fn name(&self) -> &str {
                &Leaf::base(self).name
            }

            fn kind(&self) -> LayerKind {
                <$leaf as Leaf>::KIND
            }

            fn owns_output(&self) -> bool {
                <$leaf as Leaf>::OWNS_OUTPUT
            }

            fn has_params(&self) -> bool {
                Leaf::trainable(self)
            }

            fn in_shape(&self) -> Option<Flow<Shape>> {
                Leaf::base(self).in_shape.clone().map(Flow::One)
            }

            fn out_shape(&self) -> Option<Flow<Shape>> {
                Leaf::base(self).out_shape.clone().map(Flow::One)
            }

            fn prev(&self) -> Option<Link> {
                Leaf::base(self).prev.clone()
            }

            fn set_next(&mut self, next: Link) {
                Leaf::base_mut(self).next = Some(next);
            }

            fn configure(&mut self, input: &Incoming) -> Result<()> {
                let in_shape = input.one_shape(&Leaf::base(self).name)?.clone();
                let out_shape = Leaf::infer_out_shape(self, &in_shape)?;
                Leaf::base_mut(self).configure(in_shape, out_shape, input.prev.clone());
                Ok(())
            }

            fn allocate(&mut self, be: &Backend, shared: Option<&Buffer>) -> Result<()> {
                Leaf::base_mut(self).bind_dims(be)?;
                if <$leaf as Leaf>::OWNS_OUTPUT {
                    Leaf::base_mut(self).allocate_outputs(be, shared)?;
                }
                Leaf::allocate_params(self, be)
            }

            fn set_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
                Leaf::base_mut(self).take_deltas(be, pool)
            }

            fn delta_volume(&self) -> usize {
                Leaf::base(self).in_shape.as_ref().map_or(0, Shape::volume)
            }

            fn outputs(&self) -> Option<Flow<Buffer>> {
                Leaf::base(self).outputs.clone().map(Flow::One)
            }

            fn deltas(&self) -> Option<Buffer> {
                Leaf::base(self).deltas.clone()
            }

            fn fprop(
                &mut self,
                inputs: Option<&Flow<Buffer>>,
                inference: bool,
            ) -> Result<Flow<Buffer>> {
                let x = single_input(inputs, &Leaf::base(self).name)?;
                Leaf::base(self).check_input(&x)?;
                Leaf::forward(self, &x, inference)?;
                Ok(Flow::One(Leaf::base(self).outputs()?.clone()))
            }

            fn bprop(
                &mut self,
                error: &Flow<Buffer>,
                alpha: f32,
                beta: f32,
            ) -> Result<Option<Buffer>> {
                let error = error.one(&Leaf::base(self).name)?.clone();
                Leaf::backward(self, &error, alpha, beta)?;
                Ok(Leaf::base(self).deltas.clone())
            }

            fn get_terminal(&self) -> Result<Flow<Terminal>> {
                let base = Leaf::base(self);
                Ok(Flow::One(Terminal {
                    name: base.name.clone(),
                    out_shape: base.out_shape()?.clone(),
                }))
            }

            fn get_params(&mut self) -> Vec<(&mut Array2<f32>, &Array2<f32>)> {
                Leaf::params_mut(self)
            }

            fn get_description(&self, get_weights: bool) -> LayerDescriptor {
                Leaf::describe(self, get_weights)
            }

            fn load_weights(&mut self, desc: &LayerDescriptor) -> Result<()> {
                Leaf::restore(self, desc)
            }
        }
    )*};
}

impl_trait_layer_for_leaf!(Linear, Bias, Activation, Convolution, DataTransform, Dropout);
