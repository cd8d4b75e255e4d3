/*
 * @Author       : 老董
 * @Date         : 2026-10-08
 * @Description  : 层容器相关的错误类型
 *
 * 本crate中所有结构性问题都在 构造/configure/allocate 阶段同步抛出，不做任何重试或恢复。
 */

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    // 拓扑结构不合法（如链的根层不持有输出、辅助分支不以BranchNode开头等）
    #[error("结构错误：{0}")]
    Structure(String),

    #[error("{container}需要{expected}个梯度缓冲区，实际得到{got}个")]
    DeltaPoolSize {
        container: String,
        expected: usize,
        got: usize,
    },

    #[error("不支持的合并模式`{0}`，仅支持recurrent、depth、stack")]
    UnsupportedMerge(String),

    #[error("无法识别的层类型`{0}`")]
    UnknownLayerType(String),

    #[error("描述符与{container}不匹配：{container}有{expected}个子层，描述符却含{got}个")]
    ChildCountMismatch {
        container: String,
        expected: usize,
        got: usize,
    },

    #[error("形状不匹配：期望{expected:?}，实际为{got:?}。{message}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
        message: String,
    },

    // 调用顺序须为 configure -> allocate -> (fprop/bprop)*
    #[error("{0}尚未configure")]
    NotConfigured(String),
    #[error("{0}尚未分配缓冲区")]
    NotAllocated(String),

    #[error("输入不合法：{0}")]
    InvalidInput(String),

    #[error("描述符（反）序列化失败：{0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, LayerError>;

impl From<serde_json::Error> for LayerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for LayerError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
