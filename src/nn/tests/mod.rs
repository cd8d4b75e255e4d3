mod leaf_layers;
mod sequential;

use crate::backend::{Backend, Buffer};
use crate::nn::{Flow, Layer, TraitLayer};
use ndarray::Array2;

/// 固定种子的后端
fn backend(bsz: usize) -> Backend {
    Backend::with_seed(bsz, 42).unwrap()
}

fn one(data: Array2<f32>) -> Flow<Buffer> {
    Flow::One(Buffer::from_array(&data))
}

/// 单路数据流的内容
fn values(flow: &Flow<Buffer>) -> Array2<f32> {
    flow.one("test").unwrap().to_array()
}

/// 第`index`个可训练层的(参数, 梯度)
fn param_and_grad(container: &mut impl TraitLayer, index: usize) -> (Array2<f32>, Array2<f32>) {
    let mut layers = container.layers_to_optimize();
    let layer: &mut Layer = layers.remove(index);
    let (w, dw) = layer.get_params().remove(0);
    (w.clone(), dw.clone())
}
