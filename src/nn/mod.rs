/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : 负责神经网络（neural network）层与层容器的组合、传播与描述
 */

mod container;
mod cost;
mod descriptor;
mod init;
pub mod layer;
mod shape;

pub use container::{
    MergeBroadcast, MergeMode, MergeMultistream, Nest, ResidualModule, Sequential, Tree,
};
pub use cost::{CostFunction, GeneralizedCost, Multicost};
pub use descriptor::{CostDescriptor, LayerConfig, LayerDescriptor, MulticostDescriptor, ParamMap};
pub use init::Init;
pub use layer::{
    Activation, Bias, BranchNode, Convolution, DataTransform, Dropout, Layer, LayerKind, Linear,
    TraitLayer, Transform,
};
pub use shape::{Flow, Incoming, Link, Shape, Terminal};

#[cfg(test)]
mod tests;
