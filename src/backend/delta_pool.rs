/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : 反向传播用的梯度缓冲池（DeltaPool）
 *
 * 池中固定有1、2或4个等大的缓冲区。`current()`是下一个使用者将要占用的缓冲区，
 * `advance()`把池“镜像”一次，使再下一个使用者拿到离刚才那块最远的缓冲区：
 * - 2个缓冲区时即交替使用（相邻两层的输入梯度/输出梯度永不重叠）；
 * - 4个缓冲区时，合并/残差容器自用中间两块，外层下一个使用者拿到末尾那块。
 * 子池（`slots`）是独立的值，在子池上推进不会影响父池。
 */

use super::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use crate::nn::Shape;
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct DeltaPool {
    buffers: Vec<Buffer>,
}

impl DeltaPool {
    /// 分配`count`个容量为`volume`（每个样本）的梯度缓冲区
    pub fn allocate(be: &Backend, count: usize, volume: usize) -> Result<Self> {
        if !matches!(count, 1 | 2 | 4) {
            return Err(LayerError::DeltaPoolSize {
                container: "DeltaPool".to_string(),
                expected: 2,
                got: count,
            });
        }
        let shape = Shape::flat(volume);
        let buffers = (0..count)
            .map(|_| be.iobuf(&shape, None))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(count, volume, "分配梯度缓冲池");
        Ok(Self { buffers })
    }

    pub fn from_buffers(buffers: Vec<Buffer>) -> Self {
        Self { buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// 下一个使用者将占用的缓冲区
    pub fn current(&self) -> Result<&Buffer> {
        self.buffers
            .first()
            .ok_or_else(|| LayerError::Structure("梯度缓冲池为空".to_string()))
    }

    pub fn advance(&mut self) {
        self.buffers.reverse();
    }

    /// 校验池的大小恰为`expected`
    pub fn require(&self, expected: usize, container: &str) -> Result<()> {
        if self.buffers.len() != expected {
            return Err(LayerError::DeltaPoolSize {
                container: container.to_string(),
                expected,
                got: self.buffers.len(),
            });
        }
        Ok(())
    }

    /// 取出`range`范围内的缓冲区组成一个新池
    pub fn slots(&self, range: Range<usize>) -> Result<Self> {
        self.buffers
            .get(range.clone())
            .map(|b| Self {
                buffers: b.to_vec(),
            })
            .ok_or_else(|| {
                LayerError::Structure(format!(
                    "梯度缓冲池只有{}个缓冲区，无法取出{range:?}",
                    self.buffers.len()
                ))
            })
    }
}
