/*
 * @Author       : 老董
 * @Date         : 2026-10-13
 * @Description  : 叶子层单元测试：形状推断、前向/反向数值与构造校验
 */

use super::{backend, one, param_and_grad, values};
use crate::assert_err;
use crate::errors::LayerError;
use crate::nest;
use crate::nn::{
    Activation, Bias, Convolution, DataTransform, Dropout, Flow, Incoming, Init, Layer, LayerKind,
    Linear, Sequential, Shape, TraitLayer, Transform,
};
use approx::assert_abs_diff_eq;
use ndarray::{Array2, array};
use std::str::FromStr;

// ==================== Linear ====================

#[test]
fn test_linear_forward() -> Result<(), LayerError> {
    let be = backend(1);
    let mut fc = Linear::new(2, Init::Constant(0.5));
    fc.initialize(&be, &Incoming::shape(3))?;
    let y = fc.fprop(Some(&one(array![[1.0], [2.0], [3.0]])), false)?;
    assert_eq!(values(&y), array![[3.0], [3.0]]);
    // 独立使用时没有前驱，也就没有梯度缓冲区
    assert!(fc.deltas().is_none());
    Ok(())
}

#[test]
fn test_linear_sequence_shape() -> Result<(), LayerError> {
    let be = backend(2);
    let mut fc = Linear::new(4, Init::Zeros);
    fc.configure(&Incoming::shape([3, 5]))?;
    assert_eq!(fc.out_shape(), Some(Flow::One(Shape::new(&[4, 5]))));
    fc.allocate(&be, None)?;
    assert_eq!(fc.weights().map(Array2::dim), Some((4, 3)));
    // 时间步展开在列上：T * bsz
    assert_eq!(fc.outputs().unwrap().one("fc")?.dims(), (4, 10));
    Ok(())
}

#[test]
fn test_linear_set_weights_checks_shape() -> Result<(), LayerError> {
    let mut fc = Linear::new(2, Init::Zeros).with_name("fc");
    fc.configure(&Incoming::shape(3))?;
    assert_err!(
        fc.set_weights(Array2::zeros((2, 2))),
        LayerError::ShapeMismatch([2, 3], [2, 2], "fc的权重形状不符")
    );
    assert!(fc.set_weights(Array2::ones((2, 3))).is_ok());
    Ok(())
}

// ==================== 原地层 ====================

#[test]
fn test_pass_through_constructors_validate() {
    assert_err!(DataTransform::new(0.0), LayerError::InvalidInput(_));
    assert_err!(DataTransform::new(f32::NAN), LayerError::InvalidInput(_));
    assert_err!(Dropout::new(0.0), LayerError::InvalidInput(_));
    assert_err!(Dropout::new(1.5), LayerError::InvalidInput(_));
    assert!(Dropout::new(1.0).is_ok());
}

#[test]
fn test_data_transform_scales_in_place() -> Result<(), LayerError> {
    let be = backend(1);
    let mut dt = DataTransform::new(255.0)?;
    dt.initialize(&be, &Incoming::shape(2))?;
    let x = one(array![[255.0], [51.0]]);
    let y = dt.fprop(Some(&x), false)?;
    assert_abs_diff_eq!(values(&y), array![[1.0], [0.2]], epsilon = 1e-6);
    // 原地：输出就是输入缓冲区本身
    assert!(y.one("dt")?.same_view(x.one("x")?));
    Ok(())
}

#[test]
fn test_dropout_inference_scales_by_keep() -> Result<(), LayerError> {
    let be = backend(1);
    let mut drop = Dropout::new(0.5)?;
    drop.initialize(&be, &Incoming::shape(4))?;
    let y = drop.fprop(Some(&one(Array2::ones((4, 1)))), true)?;
    assert_eq!(values(&y), Array2::from_elem((4, 1), 0.5));
    Ok(())
}

#[test]
fn test_dropout_training_masks_elements() -> Result<(), LayerError> {
    let be = backend(1);
    let mut drop = Dropout::new(0.5)?;
    drop.initialize(&be, &Incoming::shape(100))?;
    let y = values(&drop.fprop(Some(&one(Array2::from_elem((100, 1), 2.0))), false)?);
    assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
    let kept = y.iter().filter(|&&v| v == 2.0).count();
    assert!(kept > 0 && kept < 100);

    // keep = 1时什么都不屏蔽
    let mut keep_all = Dropout::new(1.0)?;
    keep_all.initialize(&be, &Incoming::shape(100))?;
    let y = values(&keep_all.fprop(Some(&one(Array2::from_elem((100, 1), 2.0))), false)?);
    assert!(y.iter().all(|&v| v == 2.0));
    Ok(())
}

#[test]
fn test_activation_backward_uses_output() -> Result<(), LayerError> {
    let be = backend(1);
    let mut seq = Sequential::new(nest![
        Linear::new(1, Init::Constant(1.0)),
        Activation::new(Transform::Tanh),
    ])?;
    seq.initialize(&be, &Incoming::shape(1))?;
    let y = values(&seq.fprop(Some(&one(array![[0.5]])), false)?);
    let t = 0.5f32.tanh();
    assert_abs_diff_eq!(y[[0, 0]], t, epsilon = 1e-6);

    seq.bprop(&one(array![[1.0]]), 1.0, 0.0)?;
    let (_, dw) = param_and_grad(&mut seq, 0);
    assert_abs_diff_eq!(dw[[0, 0]], (1.0 - t * t) * 0.5, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_bias_adds_per_feature() -> Result<(), LayerError> {
    let be = backend(2);
    let mut seq = Sequential::new(nest![
        Linear::new(2, Init::Zeros),
        Bias::new(Init::Constant(1.0)).with_name("b"),
    ])?;
    seq.initialize(&be, &Incoming::shape(3))?;
    let y = seq.fprop(Some(&one(Array2::ones((3, 2)))), false)?;
    assert_eq!(values(&y), Array2::<f32>::ones((2, 2)));

    // db为误差按行（跨样本）求和
    seq.bprop(&one(Array2::ones((2, 2))), 1.0, 0.0)?;
    let (_, db) = param_and_grad(&mut seq, 1);
    assert_eq!(db, array![[2.0], [2.0]]);
    Ok(())
}

#[test]
fn test_bias_shared_per_channel() -> Result<(), LayerError> {
    let be = backend(1);
    let mut seq = Sequential::new(nest![
        Convolution::new((1, 1, 2), Init::Zeros),
        Bias::new(Init::Zeros),
    ])?;
    seq.initialize(&be, &Incoming::shape([1, 3, 3]))?;
    let Layer::Bias(bias) = &seq.layers()[1] else {
        panic!("第二层应为Bias");
    };
    assert_eq!(bias.bias().map(Array2::dim), Some((2, 1)));
    Ok(())
}

// ==================== Convolution ====================

#[test]
fn test_convolution_shape_inference() -> Result<(), LayerError> {
    let cases = [
        (Convolution::new((3, 3, 2), Init::Zeros), [2, 2, 2]),
        (Convolution::new((3, 3, 2), Init::Zeros).with_padding(1), [2, 4, 4]),
        (
            Convolution::new((3, 3, 2), Init::Zeros)
                .with_padding(1)
                .with_stride(2),
            [2, 2, 2],
        ),
    ];
    for (mut conv, expected) in cases {
        conv.configure(&Incoming::shape([1, 4, 4]))?;
        assert_eq!(conv.out_shape(), Some(Flow::One(Shape::new(&expected))));
    }
    Ok(())
}

#[test]
fn test_convolution_rejects_flat_input() {
    let mut conv = Convolution::new((3, 3, 2), Init::Zeros);
    assert_err!(conv.configure(&Incoming::shape(16)), LayerError::ShapeMismatch { .. });
    // 卷积核大于输入
    assert_err!(
        conv.configure(&Incoming::shape([1, 2, 2])),
        LayerError::ShapeMismatch { expected, .. } if expected == &[3, 3]
    );
}

#[test]
fn test_convolution_forward_backward() -> Result<(), LayerError> {
    let be = backend(1);
    let mut conv = Convolution::new((2, 2, 1), Init::Ones);
    conv.initialize(&be, &Incoming::shape([1, 3, 3]))?;
    let y = conv.fprop(Some(&one(Array2::ones((9, 1)))), false)?;
    assert_eq!(values(&y), Array2::from_elem((4, 1), 4.0));

    // 每个抽头在4个输出位置上各见到一次输入1
    conv.bprop(&one(Array2::ones((4, 1))), 1.0, 0.0)?;
    let (_, dw) = conv.get_params().remove(0);
    assert_eq!(dw, &array![[4.0, 4.0, 4.0, 4.0]]);
    Ok(())
}

#[test]
fn test_frozen_convolution_exposes_no_params() -> Result<(), LayerError> {
    let be = backend(1);
    let mut conv = Convolution::new((1, 1, 1), Init::Identity).frozen(true);
    conv.initialize(&be, &Incoming::shape([1, 2, 2]))?;
    assert!(!conv.has_params());
    assert!(conv.get_params().is_empty());
    Ok(())
}

// ==================== LayerKind ====================

#[test]
fn test_layer_kind_from_str() {
    assert_eq!(LayerKind::from_str("Tree").unwrap(), LayerKind::Tree);
    // 允许带模块路径
    assert_eq!(
        LayerKind::from_str("layers.container.MergeBroadcast").unwrap(),
        LayerKind::MergeBroadcast
    );
    assert_err!(LayerKind::from_str("Conv2d"), LayerError::UnknownLayerType("Conv2d"));
    assert!(LayerKind::ResidualModule.needs_extra_deltas());
    assert!(!LayerKind::Sequential.needs_extra_deltas());
}
