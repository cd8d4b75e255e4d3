/*
 * @Author       : 老董
 * @Date         : 2026-10-10
 * @Description  : 层容器：把层组合成链、树、分叉-合并与残差结构
 *
 * 容器与叶子层对外暴露同一个`TraitLayer`接口，只负责递归地
 * 推断形状、分配/别名缓冲区，以及按顺序驱动前向/反向传播，自身不做数值计算。
 */

mod merge;
mod residual;
mod sequential;
mod tree;

pub use merge::{MergeBroadcast, MergeMode, MergeMultistream};
pub use residual::ResidualModule;
pub use sequential::Sequential;
pub use tree::Tree;

use super::descriptor::LayerDescriptor;
use super::layer::{Layer, TraitLayer};
use crate::errors::{LayerError, Result};

// ==================== Nest ====================

/// 任意嵌套的层列表，Sequential构造时按深度优先顺序展平
#[derive(Debug)]
pub enum Nest {
    Leaf(Layer),
    List(Vec<Nest>),
}

impl Nest {
    pub fn layers<L: Into<Layer>>(layers: Vec<L>) -> Self {
        Self::List(layers.into_iter().map(|l| Self::Leaf(l.into())).collect())
    }

    /// 深度优先、从左到右展平
    pub fn flatten(self) -> Vec<Layer> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<Layer>) {
        match self {
            Self::Leaf(layer) => out.push(layer),
            Self::List(items) => items.into_iter().for_each(|n| n.flatten_into(out)),
        }
    }
}

impl From<Layer> for Nest {
    fn from(layer: Layer) -> Self {
        Self::Leaf(layer)
    }
}

impl From<Vec<Nest>> for Nest {
    fn from(items: Vec<Nest>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<Layer>> for Nest {
    fn from(layers: Vec<Layer>) -> Self {
        Self::layers(layers)
    }
}

/// 构造嵌套层列表：`nest![a, b, [c, [d, e]], f]`
///
/// 方括号表示一层嵌套，其余元素须能转换为`Layer`。
#[macro_export]
macro_rules! nest {
    (@acc [$($done:expr,)*]) => {
        $crate::nn::Nest::List(vec![$($done,)*])
    };
    (@acc [$($done:expr,)*] [$($inner:tt)*] $(, $($rest:tt)*)?) => {
        $crate::nest!(@acc [$($done,)* $crate::nest![$($inner)*],] $($($rest)*)?)
    };
    (@acc [$($done:expr,)*] $item:expr $(, $($rest:tt)*)?) => {
        $crate::nest!(
            @acc [$($done,)* $crate::nn::Nest::from($crate::nn::Layer::from($item)),]
            $($($rest)*)?
        )
    };
    () => {
        $crate::nn::Nest::List(Vec::new())
    };
    ($($tokens:tt)+) => {
        $crate::nest!(@acc [] $($tokens)+)
    };
}

/// 把嵌套输入整理成Sequential：已是Sequential的原样保留，其余包装成Sequential
pub(crate) fn into_sequential(item: Nest) -> Result<Sequential> {
    match item {
        Nest::Leaf(Layer::Sequential(seq)) => Ok(seq),
        other => Sequential::new(other),
    }
}

// ==================== 递归辅助 ====================

/// 深度优先收集可训练叶子：容器向下递归，结构节点跳过
pub(crate) fn collect_trainable<'a>(layers: impl Iterator<Item = &'a mut Layer>) -> Vec<&'a mut Layer> {
    let mut out = Vec::new();
    for layer in layers {
        if layer.kind().is_container() {
            out.extend(layer.layers_to_optimize());
        } else if layer.has_params() {
            out.push(layer);
        }
    }
    out
}

/// 按顺序把描述中的子层权重加载到对应子层；子层数量必须一致
pub(crate) fn load_children<'a>(
    container: &str,
    children: Vec<&'a mut dyn TraitLayer>,
    desc: &LayerDescriptor,
) -> Result<()> {
    if desc.layers.len() != children.len() {
        return Err(LayerError::ChildCountMismatch {
            container: container.to_string(),
            expected: children.len(),
            got: desc.layers.len(),
        });
    }
    for (child, child_desc) in children.into_iter().zip(&desc.layers) {
        child.load_weights(child_desc)?;
    }
    Ok(())
}

/// 容器的缩进结构输出
pub(crate) fn nested_block<'a>(
    kind: &str,
    level: usize,
    children: impl Iterator<Item = &'a dyn TraitLayer>,
) -> String {
    let pad = "  ".repeat(level);
    let mut lines = vec![format!("{pad}{kind}")];
    lines.extend(children.map(|c| c.nested_str(level + 1)));
    lines.join("\n")
}
