/*
 * @Author       : 老董
 * @Date         : 2026-10-08
 * @Description  : 共享存储上的非拥有视图（Buffer）
 *
 * 一个Buffer = 共享存储（Rc<RefCell<Vec<f32>>>） + 矩形区域（offset, rows, cols, row_stride）。
 * 克隆Buffer只克隆句柄，不复制数据；合并容器的各子路径、梯度缓冲池的各使用者都通过它
 * 以“别名”的方式读写同一块内存。
 *
 * 写入约定：同一轮传播中，每个区域只有一个写入者（由不重叠的切片范围在构造时保证），
 * 前向与反向之间对同一物理内存的复用由 alpha/beta（覆盖或累加）约定来协调。
 */

use crate::errors::{LayerError, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, ShapeBuilder};
use std::cell::RefCell;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

#[derive(Clone)]
pub struct Buffer {
    storage: Rc<RefCell<Vec<f32>>>,
    offset: usize,
    rows: usize,
    cols: usize,
    row_stride: usize,
}

impl Buffer {
    /// 创建一个`rows`行`cols`列、独占新存储的全零缓冲区
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            storage: Rc::new(RefCell::new(vec![0.0; rows * cols])),
            offset: 0,
            rows,
            cols,
            row_stride: cols,
        }
    }

    /// 复制`array`的数据到一块新存储中
    pub fn from_array(array: &Array2<f32>) -> Self {
        let (rows, cols) = array.dim();
        let data = array.iter().copied().collect::<Vec<_>>();
        Self {
            storage: Rc::new(RefCell::new(data)),
            offset: 0,
            rows,
            cols,
            row_stride: cols,
        }
    }

    pub fn from_vec(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(LayerError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![data.len()],
                message: "数据长度须等于行数与列数之积".to_string(),
            });
        }
        Ok(Self {
            storage: Rc::new(RefCell::new(data)),
            offset: 0,
            rows,
            cols,
            row_stride: cols,
        })
    }

    pub const fn rows(&self) -> usize {
        self.rows
    }

    pub const fn cols(&self) -> usize {
        self.cols
    }

    pub const fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 视图内的元素在底层存储中是否连续
    pub const fn is_contiguous(&self) -> bool {
        self.rows <= 1 || self.row_stride == self.cols
    }

    /// 两个视图是否落在同一块存储上（不论区域是否重叠）
    pub fn shares_storage(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    /// 两个句柄是否指向完全相同的区域
    pub fn same_view(&self, other: &Self) -> bool {
        self.shares_storage(other)
            && self.offset == other.offset
            && self.dims() == other.dims()
            && self.row_stride == other.row_stride
    }

    // ========== 别名/切片 ==========

    /// 以`rows`x`cols`的形状复用本缓冲区的内存。
    /// 形状完全一致时直接返回本视图（对跨步视图同样成立）；
    /// 否则把本视图的连续前缀重新解释为新形状。
    pub fn share(&self, rows: usize, cols: usize) -> Result<Self> {
        if (rows, cols) == self.dims() {
            return Ok(self.clone());
        }
        if !self.is_contiguous() {
            return Err(LayerError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![self.rows, self.cols],
                message: "跨步视图只能以相同形状被复用".to_string(),
            });
        }
        if rows * cols > self.len() {
            return Err(LayerError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![self.rows, self.cols],
                message: format!("被复用的缓冲区容量不足：需要{}个元素", rows * cols),
            });
        }
        Ok(Self {
            storage: Rc::clone(&self.storage),
            offset: self.offset,
            rows,
            cols,
            row_stride: cols,
        })
    }

    /// 取`range`范围内的行（连续缓冲区的行切片仍然连续）
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.rows {
            return Err(LayerError::InvalidInput(format!(
                "行切片{range:?}越界：缓冲区只有{}行",
                self.rows
            )));
        }
        Ok(Self {
            storage: Rc::clone(&self.storage),
            offset: self.offset + range.start * self.row_stride,
            rows: range.len(),
            cols: self.cols,
            row_stride: self.row_stride,
        })
    }

    /// 取`range`范围内的列（结果通常是跨步视图）
    pub fn slice_cols(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.cols {
            return Err(LayerError::InvalidInput(format!(
                "列切片{range:?}越界：缓冲区只有{}列",
                self.cols
            )));
        }
        Ok(Self {
            storage: Rc::clone(&self.storage),
            offset: self.offset + range.start,
            rows: self.rows,
            cols: range.len(),
            row_stride: self.row_stride,
        })
    }

    // ========== 读写 ==========

    fn span(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            0
        } else {
            (self.rows - 1) * self.row_stride + self.cols
        }
    }

    fn view_error(&self, storage_len: usize, e: ndarray::ShapeError) -> LayerError {
        LayerError::ShapeMismatch {
            expected: vec![self.offset + self.span()],
            got: vec![storage_len],
            message: format!("无法在存储上构造{}x{}的视图（行步长{}）：{e}", self.rows, self.cols, self.row_stride),
        }
    }

    /// 以只读视图访问本缓冲区
    pub fn with_view<R>(&self, f: impl FnOnce(ArrayView2<'_, f32>) -> R) -> Result<R> {
        let data = self.storage.borrow();
        let end = (self.offset + self.span()).min(data.len());
        let view = ArrayView2::from_shape(
            (self.rows, self.cols).strides((self.row_stride, 1)),
            &data[self.offset.min(end)..end],
        )
        .map_err(|e| self.view_error(data.len(), e))?;
        Ok(f(view))
    }

    /// 以可写视图访问本缓冲区
    pub fn with_view_mut<R>(&self, f: impl FnOnce(ArrayViewMut2<'_, f32>) -> R) -> Result<R> {
        let mut data = self.storage.borrow_mut();
        let len = data.len();
        let end = (self.offset + self.span()).min(len);
        let view = ArrayViewMut2::from_shape(
            (self.rows, self.cols).strides((self.row_stride, 1)),
            &mut data[self.offset.min(end)..end],
        )
        .map_err(|e| self.view_error(len, e))?;
        Ok(f(view))
    }

    /// 把视图内容复制为一个独立的数组
    pub fn to_array(&self) -> Array2<f32> {
        let data = self.storage.borrow();
        Array2::from_shape_fn((self.rows, self.cols), |(r, c)| {
            data[self.offset + r * self.row_stride + c]
        })
    }

    fn check_dims(&self, other: (usize, usize), action: &str) -> Result<()> {
        if self.dims() != other {
            return Err(LayerError::ShapeMismatch {
                expected: vec![self.rows, self.cols],
                got: vec![other.0, other.1],
                message: format!("{action}时两侧形状须一致"),
            });
        }
        Ok(())
    }

    /// `self = alpha * src + beta * self`；`beta == 0`时直接覆盖（不读取旧值）
    pub fn blend(&self, src: ArrayView2<'_, f32>, alpha: f32, beta: f32) -> Result<()> {
        self.check_dims(src.dim(), "累加")?;
        self.with_view_mut(|mut dst| {
            if beta == 0.0 {
                dst.zip_mut_with(&src, |d, &s| *d = alpha * s);
            } else {
                dst.zip_mut_with(&src, |d, &s| *d = alpha * s + beta * *d);
            }
        })
    }

    /// 同`blend`，但来源也是Buffer（允许与本缓冲区共享存储）
    pub fn blend_from(&self, src: &Self, alpha: f32, beta: f32) -> Result<()> {
        if self.same_view(src) {
            // 自身累加：self = (alpha + beta) * self
            let scale = alpha + beta;
            return self.with_view_mut(|mut v| v.mapv_inplace(|x| x * scale));
        }
        let src = src.to_array();
        self.blend(src.view(), alpha, beta)
    }

    pub fn assign(&self, src: ArrayView2<'_, f32>) -> Result<()> {
        self.blend(src, 1.0, 0.0)
    }

    pub fn assign_from(&self, src: &Self) -> Result<()> {
        self.blend_from(src, 1.0, 0.0)
    }

    pub fn add_assign_from(&self, src: &Self) -> Result<()> {
        self.blend_from(src, 1.0, 1.0)
    }

    pub fn fill(&self, value: f32) {
        let mut data = self.storage.borrow_mut();
        for r in 0..self.rows {
            let start = self.offset + r * self.row_stride;
            data[start..start + self.cols].fill(value);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("offset", &self.offset)
            .field("dims", &self.dims())
            .field("row_stride", &self.row_stride)
            .finish()
    }
}
