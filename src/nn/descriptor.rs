/*
 * @Author       : 老董
 * @Date         : 2026-10-10
 * @Description  : 层描述符（Layer Descriptor）
 *                 嵌套的可序列化描述：类型 + 配置 + 子层描述（+ 可选的权重），
 *                 用于结构导出、按描述重建（gen_class）与权重加载
 */

use super::container::{
    MergeBroadcast, MergeMode, MergeMultistream, Nest, ResidualModule, Sequential, Tree,
};
use super::cost::CostFunction;
use super::layer::{
    Activation, Bias, BranchNode, Convolution, DataTransform, Dropout, Layer, LayerKind, Leaf,
    Linear, Transform,
};
use super::Init;
use crate::errors::{LayerError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// 参数名 -> 参数值
pub type ParamMap = BTreeMap<String, Array2<f32>>;

/// 层的可序列化描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// 层类型名（如`Sequential`、`Linear`），重建时据此选择构造方式
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub config: LayerConfig,
    /// 子层描述（仅容器），顺序即子层顺序
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
    /// 参数（仅在`get_description(true)`时给出）
    #[serde(default)]
    pub params: Option<ParamMap>,
}

/// 各类型的构造配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerConfig {
    None,
    Linear {
        nout: usize,
        init: Init,
    },
    Bias {
        init: Init,
    },
    Activation {
        transform: Transform,
    },
    Convolution {
        fshape: (usize, usize, usize),
        stride: usize,
        padding: usize,
        init: Init,
        frozen: bool,
    },
    DataTransform {
        divisor: f32,
    },
    Dropout {
        keep: f32,
    },
    Tree {
        alphas: Vec<f32>,
    },
    Merge {
        merge: MergeMode,
        alphas: Vec<f32>,
    },
    Residual {
        projection: Option<Init>,
    },
}

impl LayerDescriptor {
    pub fn new(kind: LayerKind, name: &str, config: LayerConfig) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            name: name.to_string(),
            config,
            layers: Vec::new(),
            params: None,
        }
    }

    pub fn with_layers(mut self, layers: Vec<Self>) -> Self {
        self.layers = layers;
        self
    }

    pub fn layer_kind(&self) -> Result<LayerKind> {
        LayerKind::from_str(&self.kind)
    }

    pub fn param(&self, key: &str) -> Option<&Array2<f32>> {
        self.params.as_ref().and_then(|p| p.get(key))
    }

    /// 递归校验所有类型名都已注册
    pub fn validate(&self) -> Result<()> {
        self.layer_kind()?;
        self.layers.iter().try_for_each(Self::validate)
    }

    /// 转换为 JSON 字符串
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 从 JSON 字符串解析（未注册的类型名报`UnknownLayerType`）
    pub fn from_json(json: &str) -> Result<Self> {
        let desc: Self = serde_json::from_str(json)?;
        desc.validate()?;
        Ok(desc)
    }

    /// 二进制编码（bincode），适合携带权重的描述
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let desc: Self = bincode::deserialize(bytes)?;
        desc.validate()?;
        Ok(desc)
    }
}

// ==================== 按描述重建 ====================

/// 重建时按名字复用BranchNode，保证同名只生成一个共享节点
#[derive(Default)]
pub(crate) struct BranchRegistry {
    nodes: HashMap<String, BranchNode>,
}

impl BranchRegistry {
    fn get_or_create(&mut self, name: &str) -> BranchNode {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| BranchNode::named(name))
            .clone()
    }
}

impl Layer {
    /// 由描述符重建层（及其全部子层）；描述中带有权重时一并加载
    pub fn gen_class(desc: &LayerDescriptor) -> Result<Self> {
        let mut registry = BranchRegistry::default();
        Self::gen_class_with(desc, &mut registry)
    }

    pub(crate) fn gen_class_with(
        desc: &LayerDescriptor,
        registry: &mut BranchRegistry,
    ) -> Result<Self> {
        let kind = desc.layer_kind()?;
        let mismatch = || {
            LayerError::Serialization(format!(
                "{}（{}）的配置与类型不符：{:?}",
                desc.name, desc.kind, desc.config
            ))
        };
        let children = |registry: &mut BranchRegistry| -> Result<Vec<Self>> {
            desc.layers
                .iter()
                .map(|d| Self::gen_class_with(d, registry))
                .collect()
        };

        let layer: Self = match (kind, &desc.config) {
            (LayerKind::BranchNode, _) => registry.get_or_create(&desc.name).into(),
            (LayerKind::Linear, LayerConfig::Linear { nout, init }) => {
                let mut l = Linear::new(*nout, init.clone()).with_name(&desc.name);
                Leaf::restore(&mut l, desc)?;
                l.into()
            }
            (LayerKind::Bias, LayerConfig::Bias { init }) => {
                let mut l = Bias::new(init.clone()).with_name(&desc.name);
                Leaf::restore(&mut l, desc)?;
                l.into()
            }
            (LayerKind::Activation, LayerConfig::Activation { transform }) => {
                Activation::new(*transform).with_name(&desc.name).into()
            }
            (
                LayerKind::Convolution,
                LayerConfig::Convolution {
                    fshape,
                    stride,
                    padding,
                    init,
                    frozen,
                },
            ) => {
                let mut l = Convolution::new(*fshape, init.clone())
                    .with_name(&desc.name)
                    .with_stride(*stride)
                    .with_padding(*padding)
                    .frozen(*frozen);
                Leaf::restore(&mut l, desc)?;
                l.into()
            }
            (LayerKind::DataTransform, LayerConfig::DataTransform { divisor }) => {
                DataTransform::new(*divisor)?.with_name(&desc.name).into()
            }
            (LayerKind::Dropout, LayerConfig::Dropout { keep }) => {
                Dropout::new(*keep)?.with_name(&desc.name).into()
            }
            (LayerKind::Sequential, _) => {
                let layers = children(registry)?;
                Sequential::new(Nest::layers(layers))?
                    .with_name(&desc.name)
                    .into()
            }
            (LayerKind::Tree, LayerConfig::Tree { alphas }) => {
                let branches = children(registry)?.into_iter().map(Nest::from).collect();
                Tree::new(branches, Some(alphas.clone()))?
                    .with_name(&desc.name)
                    .into()
            }
            (LayerKind::MergeBroadcast, LayerConfig::Merge { merge, alphas }) => {
                let paths = children(registry)?.into_iter().map(Nest::from).collect();
                MergeBroadcast::new(paths, *merge, Some(alphas.clone()))?
                    .with_name(&desc.name)
                    .into()
            }
            (LayerKind::MergeMultistream, LayerConfig::Merge { merge, .. }) => {
                let paths = children(registry)?.into_iter().map(Nest::from).collect();
                MergeMultistream::new(paths, *merge)?
                    .with_name(&desc.name)
                    .into()
            }
            (LayerKind::ResidualModule, LayerConfig::Residual { projection }) => {
                let mut children = children(registry)?.into_iter();
                let trunk = children.next().ok_or_else(|| {
                    LayerError::Serialization(format!("{}缺少主干描述", desc.name))
                })?;
                let mut module = ResidualModule::new(Nest::from(trunk), projection.clone())?
                    .with_name(&desc.name);
                // 投影卷积的权重随描述一起恢复
                if let (Some(skip_desc), Some(Layer::Convolution(conv))) =
                    (desc.layers.get(1), module.skip_mut())
                {
                    Leaf::restore(conv, skip_desc)?;
                }
                module.into()
            }
            _ => return Err(mismatch()),
        };
        Ok(layer)
    }
}

// ==================== 代价描述 ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostDescriptor {
    pub name: String,
    pub func: CostFunction,
}

/// Multicost的描述：各代价（与Tree的末端一一对应）及其权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticostDescriptor {
    /// 格式版本
    pub version: String,
    pub costs: Vec<CostDescriptor>,
    pub weights: Vec<f32>,
}

impl MulticostDescriptor {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
