/*
 * @Author       : 老董
 * @Date         : 2026-10-12
 * @Description  : Sequential 单元测试：展平、形状推断、缓冲区交替与反向传播
 */

use super::{backend, one, param_and_grad, values};
use crate::assert_err;
use crate::errors::LayerError;
use crate::nest;
use crate::nn::{
    Activation, Bias, BranchNode, DataTransform, Flow, Incoming, Init, Layer, Linear, Nest,
    Sequential, Shape, TraitLayer, Transform,
};
use approx::assert_abs_diff_eq;
use ndarray::array;

fn names(seq: &Sequential) -> Vec<&str> {
    seq.layers().iter().map(|l| l.name()).collect()
}

// ==================== 构造 ====================

#[test]
fn test_nested_list_flattens_depth_first() {
    let seq = Sequential::new(nest![
        Linear::new(4, Init::Zeros).with_name("a"),
        [
            Activation::new(Transform::Tanh).with_name("b"),
            [Linear::new(3, Init::Zeros).with_name("c"), Bias::new(Init::Zeros).with_name("d")],
        ],
        Linear::new(2, Init::Zeros).with_name("e"),
    ])
    .unwrap();
    assert_eq!(names(&seq), ["a", "b", "c", "d", "e"]);
}

#[test]
fn test_flat_vec_and_nest_agree() {
    let from_vec = Sequential::new(vec![
        Layer::from(Linear::new(4, Init::Zeros).with_name("a")),
        Layer::from(Activation::new(Transform::Rectlin).with_name("b")),
    ])
    .unwrap();
    let from_nest = Sequential::new(Nest::List(vec![
        Nest::from(Layer::from(Linear::new(4, Init::Zeros).with_name("a"))),
        Nest::List(vec![Nest::from(Layer::from(
            Activation::new(Transform::Rectlin).with_name("b"),
        ))]),
    ]))
    .unwrap();
    assert_eq!(names(&from_vec), names(&from_nest));
}

#[test]
fn test_root_must_own_output() {
    assert_err!(
        Sequential::new(nest![Activation::new(Transform::Tanh), Linear::new(2, Init::Zeros)]),
        LayerError::Structure(msg) if msg.contains("Activation")
    );
    // 全是BranchNode也不行
    assert_err!(
        Sequential::new(nest![BranchNode::new()]),
        LayerError::Structure("Sequential至少需要一个非BranchNode层")
    );
    // 直通变换可以作链首
    assert!(Sequential::new(nest![DataTransform::new(255.0).unwrap(), Linear::new(2, Init::Zeros)]).is_ok());
}

#[test]
fn test_propagating_skips_branch_nodes() {
    let seq = Sequential::new(nest![
        Linear::new(4, Init::Zeros),
        BranchNode::new(),
        Linear::new(2, Init::Zeros),
    ])
    .unwrap();
    assert_eq!(seq.layers().len(), 3);
    assert_eq!(seq.propagating().count(), 2);
    assert!(seq.root_branch().is_none());
}

// ==================== 形状与分配 ====================

#[test]
fn test_shape_inference_through_chain() -> Result<(), LayerError> {
    let mut seq = Sequential::new(nest![
        Linear::new(5, Init::Zeros),
        Bias::new(Init::Zeros),
        Activation::new(Transform::Rectlin),
        Linear::new(2, Init::Zeros),
    ])?;
    seq.configure(&Incoming::shape(3))?;
    assert_eq!(seq.in_shape(), Some(Flow::One(Shape::flat(3))));
    assert_eq!(seq.out_shape(), Some(Flow::One(Shape::flat(2))));

    // 序列输入：时间维保持不变
    seq.configure(&Incoming::shape([3, 7]))?;
    assert_eq!(seq.out_shape(), Some(Flow::One(Shape::new(&[2, 7]))));
    Ok(())
}

#[test]
fn test_fprop_before_allocate_fails() {
    let mut seq = Sequential::new(nest![Linear::new(2, Init::Zeros)]).unwrap();
    seq.configure(&Incoming::shape(3)).unwrap();
    assert_err!(
        seq.fprop(Some(&one(array![[1.0], [2.0], [3.0]])), false),
        LayerError::NotAllocated(_)
    );
}

#[test]
fn test_input_dims_are_checked() -> Result<(), LayerError> {
    let be = backend(2);
    let mut seq = Sequential::new(nest![Linear::new(2, Init::Zeros).with_name("fc")])?;
    seq.initialize(&be, &Incoming::shape(3))?;
    assert_err!(
        seq.fprop(Some(&one(array![[1.0], [2.0], [3.0]])), false),
        LayerError::ShapeMismatch([3, 2], [3, 1], "fc的输入缓冲区形状与configure时不符")
    );
    Ok(())
}

#[test]
fn test_allocation_is_idempotent() -> Result<(), LayerError> {
    let be = backend(1);
    let mut seq = Sequential::new(nest![Linear::new(2, Init::Ones), Linear::new(2, Init::Ones)])?;
    seq.configure(&Incoming::shape(2))?;
    seq.allocate(&be, None)?;
    let before = seq.outputs().unwrap().one("seq")?.clone();
    seq.allocate(&be, None)?;
    let after = seq.outputs().unwrap().one("seq")?.clone();
    assert!(before.same_view(&after));
    Ok(())
}

#[test]
fn test_two_buffer_pool_alternates() -> Result<(), LayerError> {
    let be = backend(1);
    let mut seq = Sequential::new(nest![
        Linear::new(4, Init::Zeros),
        Activation::new(Transform::Tanh),
        Linear::new(4, Init::Zeros),
        Activation::new(Transform::Tanh),
    ])?;
    seq.initialize(&be, &Incoming::shape(3))?;
    assert_eq!(seq.pool().map(|p| p.len()), Some(2));

    let deltas: Vec<_> = seq.layers().iter().map(|l| l.deltas()).collect();
    // 拓扑的根不需要梯度缓冲区
    assert!(deltas[0].is_none());
    let (d1, d2, d3) = (
        deltas[1].clone().unwrap(),
        deltas[2].clone().unwrap(),
        deltas[3].clone().unwrap(),
    );
    assert!(!d1.shares_storage(&d2));
    assert!(!d2.shares_storage(&d3));
    assert!(d1.shares_storage(&d3));
    Ok(())
}

// ==================== 传播 ====================

#[test]
fn test_fprop_bprop_two_linear() -> Result<(), LayerError> {
    let be = backend(1);
    let mut seq = Sequential::new(nest![
        Linear::new(3, Init::Constant(0.1)).with_name("fc1"),
        Linear::new(2, Init::Constant(0.2)).with_name("fc2"),
    ])?;
    seq.initialize(&be, &Incoming::shape(2))?;

    let y = seq.fprop(Some(&one(array![[1.0], [2.0]])), false)?;
    let y = values(&y);
    assert_abs_diff_eq!(y[[0, 0]], 0.18, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[1, 0]], 0.18, epsilon = 1e-6);

    // 根层没有梯度缓冲区，因而整体返回None
    let deltas = seq.bprop(&one(array![[1.0], [1.0]]), 1.0, 0.0)?;
    assert!(deltas.is_none());

    let fc2_deltas = seq.layers()[1].deltas().unwrap().to_array();
    assert_abs_diff_eq!(fc2_deltas, array![[0.4], [0.4], [0.4]], epsilon = 1e-6);

    let (_, dw1) = param_and_grad(&mut seq, 0);
    assert_abs_diff_eq!(dw1, array![[0.4, 0.8], [0.4, 0.8], [0.4, 0.8]], epsilon = 1e-6);
    let (_, dw2) = param_and_grad(&mut seq, 1);
    assert_abs_diff_eq!(dw2, array![[0.3, 0.3, 0.3], [0.3, 0.3, 0.3]], epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_nested_sequential_returns_root_deltas() -> Result<(), LayerError> {
    let be = backend(1);
    let inner = Sequential::new(nest![
        Linear::new(2, Init::Ones).with_name("inner1"),
        Linear::new(2, Init::Ones).with_name("inner2"),
    ])?
    .with_name("inner");
    let mut seq = Sequential::new(nest![Linear::new(2, Init::Ones).with_name("stem"), inner])?;
    seq.initialize(&be, &Incoming::shape(2))?;

    seq.fprop(Some(&one(array![[1.0], [1.0]])), false)?;
    seq.bprop(&one(array![[1.0], [0.0]]), 1.0, 0.0)?;

    // inner2: Wᵀe = [1, 1]；inner1: Wᵀ[1, 1] = [2, 2]
    let Layer::Sequential(inner) = &seq.layers()[1] else {
        panic!("第二层应为Sequential");
    };
    assert_eq!(inner.deltas().unwrap().to_array(), array![[2.0], [2.0]]);
    let (_, stem_dw) = param_and_grad(&mut seq, 0);
    assert_eq!(stem_dw, array![[2.0, 2.0], [2.0, 2.0]]);
    Ok(())
}

#[test]
fn test_layers_to_optimize_in_order() -> Result<(), LayerError> {
    let mut seq = Sequential::new(nest![
        Linear::new(4, Init::Zeros).with_name("fc1"),
        Bias::new(Init::Zeros).with_name("b1"),
        Activation::new(Transform::Rectlin),
        [Linear::new(2, Init::Zeros).with_name("fc2")],
    ])?;
    let names: Vec<String> = seq
        .layers_to_optimize()
        .iter()
        .map(|l| l.name().to_string())
        .collect();
    assert_eq!(names, ["fc1", "b1", "fc2"]);
    Ok(())
}

#[test]
fn test_get_terminal_is_last_layer() -> Result<(), LayerError> {
    let mut seq = Sequential::new(nest![
        Linear::new(4, Init::Zeros).with_name("fc1"),
        Linear::new(3, Init::Zeros).with_name("out"),
    ])?;
    seq.configure(&Incoming::shape(2))?;
    let terminal = seq.get_terminal()?;
    let terminal = terminal.one("seq")?;
    assert_eq!(terminal.name, "out");
    assert_eq!(terminal.out_shape, Shape::flat(3));
    Ok(())
}

#[test]
fn test_nested_str() {
    let seq = Sequential::new(nest![
        Linear::new(4, Init::Zeros).with_name("fc"),
        Activation::new(Transform::Tanh).with_name("act"),
    ])
    .unwrap();
    assert_eq!(seq.nested_str(0), "Sequential\n  Linear(fc)\n  Activation(act)");
}
