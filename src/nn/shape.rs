/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : 形状、单/多路数据流，以及层与层之间的连接信息
 */

use super::layer::{BranchNode, LayerKind, TraitLayer};
use crate::errors::{LayerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ==================== Shape ====================

/// 张量的逻辑形状（不含批维度）。
/// 1维`[n]`即扁平的特征数；2维`[f, T]`视为按时间展开的序列；3维一般为`[C, H, W]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }

    pub fn flat(n: usize) -> Self {
        Self(vec![n])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// 元素总数
    pub fn volume(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_flat(&self) -> bool {
        self.0.len() == 1
    }
}

impl From<usize> for Shape {
    fn from(n: usize) -> Self {
        Self::flat(n)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

// ==================== Flow ====================

/// 单路或多路的数据（或形状）。
/// Tree的输出、MergeMultistream的输入都是多路的，其余一般是单路
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Flow<T> {
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn is_one(&self) -> bool {
        matches!(self, Self::One(_))
    }

    /// 取单路数据，`who`用于报错
    pub fn one(&self, who: &str) -> Result<&T> {
        match self {
            Self::One(x) => Ok(x),
            Self::Many(items) => Err(LayerError::InvalidInput(format!(
                "{who}需要单路输入，实际得到{}路",
                items.len()
            ))),
        }
    }

    pub fn many(&self, who: &str) -> Result<&[T]> {
        match self {
            Self::Many(items) => Ok(items),
            Self::One(_) => Err(LayerError::InvalidInput(format!(
                "{who}需要多路（列表）输入，实际得到单路"
            ))),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(x) => vec![x],
            Self::Many(items) => items,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Self::One(x) => std::slice::from_ref(x).iter(),
            Self::Many(items) => items.iter(),
        }
    }
}

// ==================== Link ====================

/// 执行顺序上的前驱/后继。BranchNode以句柄保存（按身份比较），其余层只记名字与类型
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    Layer { name: String, kind: LayerKind },
    Branch(BranchNode),
}

impl Link {
    pub const fn branch(&self) -> Option<&BranchNode> {
        match self {
            Self::Branch(node) => Some(node),
            Self::Layer { .. } => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Layer { name, .. } => name.clone(),
            Self::Branch(node) => node.name().to_string(),
        }
    }
}

// ==================== Incoming ====================

/// configure时传给一个层的输入信息：输入形状 + 前驱（若由另一个层产出）
#[derive(Debug, Clone)]
pub struct Incoming {
    pub shape: Flow<Shape>,
    pub prev: Option<Link>,
}

impl Incoming {
    /// 直接由数据形状（而非某个层）提供输入
    pub fn shape(shape: impl Into<Shape>) -> Self {
        Self {
            shape: Flow::One(shape.into()),
            prev: None,
        }
    }

    /// 多路独立的数据流（MergeMultistream用）
    pub fn streams(shapes: Vec<Shape>) -> Self {
        Self {
            shape: Flow::Many(shapes),
            prev: None,
        }
    }

    /// 以已configure过的`layer`为前驱
    pub fn after<L: TraitLayer + ?Sized>(layer: &L) -> Result<Self> {
        let shape = layer
            .out_shape()
            .ok_or_else(|| LayerError::NotConfigured(layer.name().to_string()))?;
        Ok(Self {
            shape,
            prev: Some(layer.link()),
        })
    }

    pub fn one_shape(&self, who: &str) -> Result<&Shape> {
        self.shape.one(who)
    }
}

// ==================== Terminal ====================

/// 承载输出的末端层，代价函数据此挂接
#[derive(Debug, Clone, PartialEq)]
pub struct Terminal {
    pub name: String,
    pub out_shape: Shape,
}
