/*
 * @Author       : 老董
 * @Date         : 2026-10-12
 * @Description  : 后端（Backend/Buffer/DeltaPool）单元测试
 */

use super::{Backend, Buffer, DeltaPool};
use crate::assert_err;
use crate::errors::LayerError;
use crate::nn::Shape;
use approx::assert_abs_diff_eq;
use ndarray::{Array2, array};

// ==================== Backend ====================

#[test]
fn test_backend_rejects_zero_batch() {
    assert_err!(Backend::new(0), LayerError::InvalidInput("批宽度必须大于0"));
}

#[test]
fn test_buffer_dims_by_rank() {
    let be = Backend::with_seed(4, 0).unwrap();
    assert_eq!(be.buffer_dims(&Shape::flat(5)), (5, 4));
    // 序列按时间展开
    assert_eq!(be.buffer_dims(&Shape::new(&[6, 3])), (6, 12));
    assert_eq!(be.buffer_dims(&Shape::new(&[2, 3, 4])), (24, 4));
}

#[test]
fn test_iobuf_fresh_and_shared() {
    let be = Backend::with_seed(2, 0).unwrap();
    let big = be.iobuf(&Shape::flat(10), None).unwrap();
    assert_eq!(big.dims(), (10, 2));

    // 复用连续前缀
    let small = be.iobuf(&Shape::flat(3), Some(&big)).unwrap();
    assert_eq!(small.dims(), (3, 2));
    assert!(small.shares_storage(&big));
    small.fill(7.0);
    big.with_view(|v| {
        assert_abs_diff_eq!(v[[0, 0]], 7.0);
        assert_abs_diff_eq!(v[[2, 1]], 7.0);
        assert_abs_diff_eq!(v[[3, 0]], 0.0);
    })
    .unwrap();

    // 容量不足
    assert_err!(
        be.iobuf(&Shape::flat(11), Some(&big)),
        LayerError::ShapeMismatch { .. }
    );
}

#[test]
fn test_seeded_backends_generate_same_numbers() {
    let a = Backend::with_seed(1, 42).unwrap();
    let b = Backend::with_seed(1, 42).unwrap();
    let xa = a.with_rng(|rng| crate::nn::Init::Kaiming.generate(3, 4, rng));
    let xb = b.with_rng(|rng| crate::nn::Init::Kaiming.generate(3, 4, rng));
    assert_eq!(xa, xb);
}

// ==================== Buffer ====================

#[test]
fn test_row_slice_aliases_parent() {
    let buf = Buffer::zeros(4, 3);
    let rows = buf.slice_rows(1..3).unwrap();
    assert!(rows.is_contiguous());
    rows.fill(1.0);
    let total: f32 = buf.to_array().sum();
    assert_abs_diff_eq!(total, 6.0);
    buf.with_view(|v| {
        assert_abs_diff_eq!(v[[0, 0]], 0.0);
        assert_abs_diff_eq!(v[[1, 2]], 1.0);
        assert_abs_diff_eq!(v[[3, 0]], 0.0);
    })
    .unwrap();
}

#[test]
fn test_col_slice_is_strided_view() {
    let buf = Buffer::from_array(&array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]]);
    let cols = buf.slice_cols(2..4).unwrap();
    assert!(!cols.is_contiguous());
    assert_eq!(cols.to_array(), array![[3.0, 4.0], [7.0, 8.0]]);

    cols.assign(array![[0.0, 0.0], [0.0, 0.0]].view()).unwrap();
    assert_eq!(buf.to_array(), array![[1.0, 2.0, 0.0, 0.0], [5.0, 6.0, 0.0, 0.0]]);

    // 跨步视图只能以相同形状复用
    assert!(cols.share(2, 2).unwrap().same_view(&cols));
    assert_err!(cols.share(1, 4), LayerError::ShapeMismatch { .. });
}

#[test]
fn test_views_on_strided_columns() -> Result<(), LayerError> {
    let buf = Buffer::from_array(&array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    let cols = buf.slice_cols(1..3)?;
    assert_abs_diff_eq!(cols.with_view(|v| v.sum())?, 16.0);

    cols.with_view_mut(|mut v| v.mapv_inplace(|a| -a))?;
    cols.fill(0.5);
    buf.slice_cols(2..3)?.with_view_mut(|mut v| v += 1.0)?;
    assert_eq!(buf.to_array(), array![[1.0, 0.5, 1.5], [4.0, 0.5, 1.5]]);
    Ok(())
}

#[test]
fn test_slice_out_of_range() {
    let buf = Buffer::zeros(2, 2);
    assert_err!(buf.slice_rows(1..3), LayerError::InvalidInput(_));
    assert_err!(buf.slice_cols(0..5), LayerError::InvalidInput(_));
}

#[test]
fn test_blend_overwrite_and_accumulate() {
    let buf = Buffer::from_array(&array![[1.0, 2.0]]);
    let src = array![[10.0, 20.0]];

    buf.blend(src.view(), 0.5, 1.0).unwrap();
    assert_eq!(buf.to_array(), array![[6.0, 12.0]]);

    // beta = 0 时不读取旧值
    buf.blend(src.view(), 2.0, 0.0).unwrap();
    assert_eq!(buf.to_array(), array![[20.0, 40.0]]);

    assert_err!(
        buf.blend(Array2::<f32>::zeros((2, 1)).view(), 1.0, 0.0),
        LayerError::ShapeMismatch([1, 2], [2, 1], "累加时两侧形状须一致")
    );
}

#[test]
fn test_blend_from_same_view() {
    let buf = Buffer::from_array(&array![[1.0, -2.0]]);
    let alias = buf.clone();
    buf.blend_from(&alias, 1.0, 1.0).unwrap();
    assert_eq!(buf.to_array(), array![[2.0, -4.0]]);
}

#[test]
fn test_blend_from_overlapping_storage() {
    // 源与目标落在同一块存储的不同区域
    let buf = Buffer::from_array(&array![[1.0], [2.0], [3.0], [4.0]]);
    let top = buf.slice_rows(0..2).unwrap();
    let bottom = buf.slice_rows(2..4).unwrap();
    top.add_assign_from(&bottom).unwrap();
    assert_eq!(buf.to_array(), array![[4.0], [6.0], [3.0], [4.0]]);
}

// ==================== DeltaPool ====================

#[test]
fn test_pool_size_must_be_1_2_or_4() {
    let be = Backend::with_seed(1, 0).unwrap();
    assert_err!(DeltaPool::allocate(&be, 3, 8), LayerError::DeltaPoolSize(2, 3));
    for count in [1, 2, 4] {
        assert_eq!(DeltaPool::allocate(&be, count, 8).unwrap().len(), count);
    }
}

#[test]
fn test_pool_advance_alternates_two_buffers() {
    let be = Backend::with_seed(1, 0).unwrap();
    let mut pool = DeltaPool::allocate(&be, 2, 4).unwrap();
    let a = pool.current().unwrap().clone();
    pool.advance();
    let b = pool.current().unwrap().clone();
    pool.advance();
    assert!(!a.shares_storage(&b));
    assert!(pool.current().unwrap().same_view(&a));
}

#[test]
fn test_pool_advance_mirrors_four_buffers() {
    let be = Backend::with_seed(1, 0).unwrap();
    let mut pool = DeltaPool::allocate(&be, 4, 4).unwrap();
    let original = pool.buffers().to_vec();
    pool.advance();
    // 下一个使用者拿到离刚才最远的那块
    assert!(pool.current().unwrap().same_view(&original[3]));
    assert!(pool.buffers()[3].same_view(&original[0]));
}

#[test]
fn test_sub_pool_is_independent() {
    let be = Backend::with_seed(1, 0).unwrap();
    let pool = DeltaPool::allocate(&be, 4, 4).unwrap();
    let mut middle = pool.slots(1..3).unwrap();
    assert!(middle.current().unwrap().same_view(&pool.buffers()[1]));
    middle.advance();
    assert!(middle.current().unwrap().same_view(&pool.buffers()[2]));
    // 父池不受影响
    assert!(pool.current().unwrap().same_view(&pool.buffers()[0]));

    assert_err!(pool.require(2, "MergeBroadcast"), LayerError::DeltaPoolSize(2, 4));
    assert_err!(pool.slots(3..5), LayerError::Structure(_));
}
