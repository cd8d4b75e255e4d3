//! # Only Layers
//!
//! `only_layers`是一个纯rust的神经网络层容器引擎：把叶子层组合成
//! 线性链（Sequential）、带辅助输出的树（Tree）、分叉-合并（MergeBroadcast/MergeMultistream）
//! 与残差（ResidualModule）结构，并负责跨任意嵌套的形状推断、输出/梯度缓冲区的分配与别名复用，
//! 以及在分支汇合处按alpha/beta正确累加梯度的前向、反向传播。
//!

pub mod backend;
pub mod errors;
pub mod nn;
pub mod utils;
