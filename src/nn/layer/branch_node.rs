/*
 * @Author       : 老董
 * @Date         : 2026-10-09
 * @Description  : BranchNode：一路输出被多条下游路径消费的分叉点
 *
 * BranchNode是对内部状态的Rc<RefCell<..>>共享句柄：
 * 克隆只克隆句柄，所有克隆指向同一个节点，按id比较身份。
 * 同一个BranchNode出现在Tree的多个分支开头，即表示这些分支在此汇合。
 */

use super::{LayerKind, TraitLayer};
use crate::backend::{Backend, Buffer, DeltaPool};
use crate::errors::{LayerError, Result};
use crate::nn::descriptor::{LayerConfig, LayerDescriptor};
use crate::nn::shape::{Flow, Incoming, Link, Shape, Terminal};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BRANCH_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct BranchState {
    in_shape: Option<Shape>,
    prev: Option<Link>,
    next: Option<Link>,
    /// 最近一次前向得到的激活，辅助分支从这里取输入
    outputs: Option<Buffer>,
    deltas: Option<Buffer>,
}

#[derive(Clone)]
pub struct BranchNode {
    id: u64,
    name: Rc<str>,
    inner: Rc<RefCell<BranchState>>,
}

impl BranchNode {
    pub fn new() -> Self {
        let id = NEXT_BRANCH_ID.fetch_add(1, Ordering::Relaxed);
        Self::build(id, format!("BranchNode_{id}"))
    }

    pub fn named(name: impl Into<String>) -> Self {
        let id = NEXT_BRANCH_ID.fetch_add(1, Ordering::Relaxed);
        Self::build(id, name.into())
    }

    fn build(id: u64, name: String) -> Self {
        Self {
            id,
            name: Rc::from(name),
            inner: Rc::new(RefCell::new(BranchState::default())),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    /// 是否与`other`是同一个节点（而非内容相同的另一个节点）
    pub fn is_same(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn in_shape_or_err(&self) -> Result<Shape> {
        self.inner
            .borrow()
            .in_shape
            .clone()
            .ok_or_else(|| LayerError::NotConfigured(self.name.to_string()))
    }
}

impl Default for BranchNode {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for BranchNode {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Eq for BranchNode {}

impl fmt::Debug for BranchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl TraitLayer for BranchNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::BranchNode
    }

    fn owns_output(&self) -> bool {
        false
    }

    fn in_shape(&self) -> Option<Flow<Shape>> {
        self.inner.borrow().in_shape.clone().map(Flow::One)
    }

    fn out_shape(&self) -> Option<Flow<Shape>> {
        self.in_shape()
    }

    fn prev(&self) -> Option<Link> {
        self.inner.borrow().prev.clone()
    }

    fn set_next(&mut self, next: Link) {
        self.inner.borrow_mut().next = Some(next);
    }

    fn link(&self) -> Link {
        Link::Branch(self.clone())
    }

    fn configure(&mut self, input: &Incoming) -> Result<()> {
        let shape = input.one_shape(&self.name)?.clone();
        let mut state = self.inner.borrow_mut();
        if state.in_shape.as_ref() != Some(&shape) {
            state.outputs = None;
        }
        // 每次configure后梯度缓冲区都要重新领取
        state.deltas = None;
        state.in_shape = Some(shape);
        state.prev = input.prev.clone();
        Ok(())
    }

    fn allocate(&mut self, _be: &Backend, _shared: Option<&Buffer>) -> Result<()> {
        Ok(())
    }

    /// 只有第一个到达的池会被占用，之后再次调用不做任何事
    fn set_deltas(&mut self, be: &Backend, pool: &mut DeltaPool) -> Result<()> {
        if self.inner.borrow().deltas.is_some() {
            return Ok(());
        }
        let shape = self.in_shape_or_err()?;
        let deltas = be.iobuf(&shape, Some(pool.current()?))?;
        pool.advance();
        self.inner.borrow_mut().deltas = Some(deltas);
        Ok(())
    }

    fn delta_volume(&self) -> usize {
        self.inner.borrow().in_shape.as_ref().map_or(0, Shape::volume)
    }

    fn outputs(&self) -> Option<Flow<Buffer>> {
        self.inner.borrow().outputs.clone().map(Flow::One)
    }

    fn deltas(&self) -> Option<Buffer> {
        self.inner.borrow().deltas.clone()
    }

    /// 有输入时缓存并原样返回；无输入时返回缓存的激活
    fn fprop(&mut self, inputs: Option<&Flow<Buffer>>, _inference: bool) -> Result<Flow<Buffer>> {
        match inputs {
            Some(flow) => {
                let x = flow.one(&self.name)?.clone();
                self.inner.borrow_mut().outputs = Some(x.clone());
                Ok(Flow::One(x))
            }
            None => self
                .inner
                .borrow()
                .outputs
                .clone()
                .map(Flow::One)
                .ok_or_else(|| {
                    LayerError::InvalidInput(format!("{}尚未在主干上执行前向传播", self.name))
                }),
        }
    }

    /// 各分支已把梯度汇入本节点的缓冲区，这里无需计算
    fn bprop(&mut self, _error: &Flow<Buffer>, _alpha: f32, _beta: f32) -> Result<Option<Buffer>> {
        Ok(self.deltas())
    }

    fn get_terminal(&self) -> Result<Flow<Terminal>> {
        Ok(Flow::One(Terminal {
            name: self.name.to_string(),
            out_shape: self.in_shape_or_err()?,
        }))
    }

    fn get_description(&self, _get_weights: bool) -> LayerDescriptor {
        LayerDescriptor::new(LayerKind::BranchNode, &self.name, LayerConfig::None)
    }

    fn load_weights(&mut self, _desc: &LayerDescriptor) -> Result<()> {
        Ok(())
    }
}
