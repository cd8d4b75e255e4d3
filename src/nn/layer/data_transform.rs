/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : DataTransform 层：把原始输入缩放到合适的数值范围（原地）
 *
 * 不持有输出，但可以作为链首：它只是就地改写外部传入的数据。
 */

use super::{LayerBase, LayerKind, Leaf};
use crate::backend::Buffer;
use crate::errors::{LayerError, Result};
use crate::nn::Shape;
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};

#[derive(Debug)]
pub struct DataTransform {
    base: LayerBase,
    divisor: f32,
}

impl DataTransform {
    pub fn new(divisor: f32) -> Result<Self> {
        if divisor == 0.0 || !divisor.is_finite() {
            return Err(LayerError::InvalidInput(format!(
                "DataTransform的除数须为非零有限值，实际为{divisor}"
            )));
        }
        Ok(Self {
            base: LayerBase::new("DataTransform"),
            divisor,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub const fn divisor(&self) -> f32 {
        self.divisor
    }
}

impl Leaf for DataTransform {
    const KIND: LayerKind = LayerKind::DataTransform;
    const OWNS_OUTPUT: bool = false;

    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn infer_out_shape(&self, in_shape: &Shape) -> Result<Shape> {
        Ok(in_shape.clone())
    }

    fn forward(&mut self, x: &Buffer, _inference: bool) -> Result<()> {
        let d = self.divisor;
        x.with_view_mut(|mut v| v.mapv_inplace(|a| a / d))?;
        self.base.inputs = Some(x.clone());
        self.base.outputs = Some(x.clone());
        Ok(())
    }

    fn backward(&mut self, error: &Buffer, alpha: f32, beta: f32) -> Result<()> {
        let grad = error.to_array() / self.divisor;
        self.base.write_deltas(grad.view(), alpha, beta)
    }

    fn describe(&self, _get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(
            LayerKind::DataTransform,
            &self.base.name,
            LayerConfig::DataTransform {
                divisor: self.divisor,
            },
        )
    }
}
