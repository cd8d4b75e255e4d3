/*
 * @Author       : 老董
 * @Date         : 2026-10-11
 * @Description  : Multicost：与Tree配套，每个分支输出一个代价函数
 *
 * 标量代价是各分支代价的加权和；误差则按分支各自独立计算，不乘权重
 * （各分支在Tree反向传播时由Tree自己的alpha缩放）。
 */

use super::GeneralizedCost;
use crate::backend::{Backend, Buffer};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{CostDescriptor, MulticostDescriptor};
use crate::nn::layer::TraitLayer;
use crate::nn::shape::Flow;

#[derive(Debug)]
pub struct Multicost {
    costs: Vec<GeneralizedCost>,
    weights: Vec<f32>,
}

impl Multicost {
    /// `weights`缺省全为1；长度须与`costs`一致
    pub fn new(costs: Vec<GeneralizedCost>, weights: Option<Vec<f32>>) -> Result<Self> {
        if costs.is_empty() {
            return Err(LayerError::Structure("Multicost至少需要一个代价函数".into()));
        }
        let weights = weights.unwrap_or_else(|| vec![1.0; costs.len()]);
        if weights.len() != costs.len() {
            return Err(LayerError::Structure(format!(
                "Multicost有{}个代价函数，却给出了{}个权重",
                costs.len(),
                weights.len()
            )));
        }
        Ok(Self { costs, weights })
    }

    pub fn costs(&self) -> &[GeneralizedCost] {
        &self.costs
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// 按顺序把每个代价挂接到`container`的对应末端层上
    pub fn initialize<L: TraitLayer + ?Sized>(&mut self, be: &Backend, container: &L) -> Result<()> {
        let terminals = container.get_terminal()?.into_vec();
        if terminals.len() != self.costs.len() {
            return Err(LayerError::Structure(format!(
                "{}有{}个末端层，Multicost却有{}个代价函数",
                container.name(),
                terminals.len(),
                self.costs.len()
            )));
        }
        for (cost, terminal) in self.costs.iter_mut().zip(&terminals) {
            cost.initialize(be, terminal)?;
        }
        Ok(())
    }

    /// 单路输入时完全交给第一个代价；多路时目标可为一个（广播给所有分支）或每分支一个。
    /// 加权和写入第一个代价的`cost`缓冲区并返回
    pub fn get_cost(&mut self, inputs: &Flow<Buffer>, targets: &Flow<Buffer>) -> Result<Buffer> {
        let inputs = match inputs {
            Flow::One(x) => {
                let t = targets.one("Multicost")?;
                return self.costs[0].get_cost(x, t);
            }
            Flow::Many(xs) => xs,
        };
        let targets = self.pair_targets(inputs.len(), targets)?;

        let mut total = 0.0;
        for ((cost, w), (x, t)) in self
            .costs
            .iter_mut()
            .zip(&self.weights)
            .zip(inputs.iter().zip(targets))
        {
            cost.get_cost(x, t)?;
            total += w * cost.value();
        }
        let out = self.costs[0].cost()?;
        out.fill(total);
        Ok(out)
    }

    /// 每个分支一个误差（未加权），顺序与Tree的分支一致
    pub fn get_errors(&mut self, inputs: &Flow<Buffer>, targets: &Flow<Buffer>) -> Result<Flow<Buffer>> {
        let inputs = inputs.many("Multicost")?;
        let targets = self.pair_targets(inputs.len(), targets)?;
        let deltas = self
            .costs
            .iter_mut()
            .zip(inputs.iter().zip(targets))
            .map(|(cost, (x, t))| cost.get_errors(x, t))
            .collect::<Result<Vec<_>>>()?;
        Ok(Flow::Many(deltas))
    }

    fn pair_targets<'a>(&self, n: usize, targets: &'a Flow<Buffer>) -> Result<Vec<&'a Buffer>> {
        if n != self.costs.len() {
            return Err(LayerError::InvalidInput(format!(
                "Multicost有{}个代价函数，却收到{n}路预测",
                self.costs.len()
            )));
        }
        match targets {
            Flow::One(t) => Ok(vec![t; n]),
            Flow::Many(ts) if ts.len() == n => Ok(ts.iter().collect()),
            Flow::Many(ts) => Err(LayerError::InvalidInput(format!(
                "Multicost收到{n}路预测，却收到{}个目标",
                ts.len()
            ))),
        }
    }

    /// 第一个代价的平均代价缓冲区
    pub fn cost(&self) -> Result<Buffer> {
        self.costs[0].cost()
    }

    pub fn outputs(&self) -> Result<Buffer> {
        self.costs[0].outputs()
    }

    pub fn get_description(&self) -> MulticostDescriptor {
        MulticostDescriptor {
            version: env!("CARGO_PKG_VERSION").to_string(),
            costs: self
                .costs
                .iter()
                .map(|c| CostDescriptor {
                    name: c.name().to_string(),
                    func: c.func(),
                })
                .collect(),
            weights: self.weights.clone(),
        }
    }

    pub fn gen_class(desc: &MulticostDescriptor) -> Result<Self> {
        let costs = desc
            .costs
            .iter()
            .map(|c| GeneralizedCost::new(c.func).with_name(&c.name))
            .collect();
        Self::new(costs, Some(desc.weights.clone()))
    }
}
