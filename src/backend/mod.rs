/*
 * @Author       : 老董
 * @Date         : 2026-10-08
 * @Description  : 计算后端：批宽度、缓冲区布局与分配、随机数
 *
 * 层容器只通过这里的窄接口与数值后端打交道：
 * - `iobuf`：按形状分配（或别名复用）一个输入/输出缓冲区
 * - `bsz`：批（并行）宽度，合并容器据此判断切分方向
 */

mod buffer;
mod delta_pool;

#[cfg(test)]
mod tests;

pub use buffer::Buffer;
pub use delta_pool::DeltaPool;

use crate::errors::{LayerError, Result};
use crate::nn::Shape;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::cell::RefCell;

#[derive(Debug)]
pub struct Backend {
    bsz: usize,
    rng: RefCell<StdRng>,
}

impl Backend {
    /// 创建批宽度为`bsz`的后端（随机数种子取自系统熵）
    pub fn new(bsz: usize) -> Result<Self> {
        Self::build(bsz, StdRng::from_entropy())
    }

    /// 创建带固定种子的后端（用于确定性训练）
    pub fn with_seed(bsz: usize, seed: u64) -> Result<Self> {
        Self::build(bsz, StdRng::seed_from_u64(seed))
    }

    fn build(bsz: usize, rng: StdRng) -> Result<Self> {
        if bsz == 0 {
            return Err(LayerError::InvalidInput("批宽度必须大于0".to_string()));
        }
        Ok(Self {
            bsz,
            rng: RefCell::new(rng),
        })
    }

    pub const fn bsz(&self) -> usize {
        self.bsz
    }

    /// 形状对应的缓冲区布局（行, 列）：
    /// - 1维`(n)` -> `(n, bsz)`
    /// - 2维`(f, T)`视为按时间展开的序列 -> `(f, T*bsz)`
    /// - 更高维 -> `(元素总数, bsz)`
    pub fn buffer_dims(&self, shape: &Shape) -> (usize, usize) {
        match shape.dims() {
            [f, t] => (*f, t * self.bsz),
            _ => (shape.volume(), self.bsz),
        }
    }

    /// 为`shape`分配一个缓冲区；若给出`shared`，则复用它的内存而不新建
    pub fn iobuf(&self, shape: &Shape, shared: Option<&Buffer>) -> Result<Buffer> {
        let (rows, cols) = self.buffer_dims(shape);
        match shared {
            Some(buf) => buf.share(rows, cols),
            None => Ok(Buffer::zeros(rows, cols)),
        }
    }

    /// 借用后端的随机数发生器
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.rng.borrow_mut())
    }

    /// 派生一个独立的随机数发生器（供Dropout等在前向时使用）
    pub fn fork_rng(&self) -> StdRng {
        self.with_rng(|rng| StdRng::from_rng(rng).unwrap_or_else(|_| StdRng::seed_from_u64(0)))
    }
}
