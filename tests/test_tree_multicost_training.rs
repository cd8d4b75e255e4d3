/*
 * @Author       : 老董
 * @Date         : 2026-10-14
 * @Description  : 端到端：带辅助输出的Tree + Multicost，用最朴素的SGD训练一个小回归任务，
 *                 主干拟合 x0 + x1，辅助分支拟合 x0 - x1。
 */
use ndarray::{Array2, Axis};
use only_layers::backend::{Backend, Buffer};
use only_layers::errors::LayerError;
use only_layers::nest;
use only_layers::nn::{
    Activation, BranchNode, CostFunction, Flow, Incoming, Init, Linear, Multicost, TraitLayer,
    Transform, Tree,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const BSZ: usize = 4;
const BATCHES: usize = 4;
const EPOCHS: usize = 300;
const LR: f32 = 0.02;

struct Batch {
    x: Array2<f32>,
    targets: Flow<Buffer>,
}

fn dataset(seed: u64) -> Vec<Batch> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..BATCHES)
        .map(|_| {
            let x = Array2::from_shape_simple_fn((2, BSZ), || rng.gen_range(-1.0..1.0));
            let (x0, x1) = (x.row(0), x.row(1));
            let sum = (&x0 + &x1).insert_axis(Axis(0));
            let diff = (&x0 - &x1).insert_axis(Axis(0));
            Batch {
                targets: Flow::Many(vec![Buffer::from_array(&sum), Buffer::from_array(&diff)]),
                x,
            }
        })
        .collect()
}

fn epoch(tree: &mut Tree, mc: &mut Multicost, data: &[Batch], train: bool) -> Result<f32, LayerError> {
    let mut total = 0.0;
    for batch in data {
        let x = Flow::One(Buffer::from_array(&batch.x));
        // 推理模式下Tree只返回主干输出，评估代价时同样需要全部分支
        let y = tree.fprop(Some(&x), false)?;
        total += mc.get_cost(&y, &batch.targets)?.to_array()[[0, 0]];
        if train {
            let errors = mc.get_errors(&y, &batch.targets)?;
            tree.bprop(&errors, 1.0, 0.0)?;
            for layer in tree.layers_to_optimize() {
                for (w, dw) in layer.get_params() {
                    w.scaled_add(-LR, dw);
                }
            }
        }
    }
    Ok(total / data.len() as f32)
}

#[test]
fn test_tree_multicost_training() -> Result<(), LayerError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let be = Backend::with_seed(BSZ, 2026)?;
    let b1 = BranchNode::named("hidden");
    let mut tree = Tree::new(
        vec![
            nest![
                Linear::new(8, Init::Kaiming).with_name("fc1"),
                Activation::new(Transform::Tanh),
                b1.clone(),
                Linear::new(1, Init::Kaiming).with_name("sum"),
            ],
            nest![b1, Linear::new(1, Init::Kaiming).with_name("diff")],
        ],
        Some(vec![1.0, 0.5]),
    )?
    .with_name("regressor");
    tree.initialize(&be, &Incoming::shape(2))?;
    info!("模型结构：\n{}", tree.nested_str(0));

    let mut mc = Multicost::new(
        vec![CostFunction::SumSquared.into(), CostFunction::SumSquared.into()],
        Some(vec![1.0, 0.5]),
    )?;
    mc.initialize(&be, &tree)?;

    let data = dataset(7);
    let initial = epoch(&mut tree, &mut mc, &data, false)?;
    info!("初始代价：{:.4}", initial);

    for i in 0..EPOCHS {
        let cost = epoch(&mut tree, &mut mc, &data, true)?;
        if i % 50 == 0 {
            info!("第{}轮，训练代价：{:.4}", i, cost);
        }
    }

    let last = epoch(&mut tree, &mut mc, &data, false)?;
    info!("训练后代价：{:.4}", last);
    assert!(last.is_finite());
    assert!(last < 0.5 * initial, "代价未下降：{} -> {}", initial, last);

    // 各分支单独的代价也应同步下降
    for cost in mc.costs() {
        info!("{} -> {:.4}", cost.name(), cost.value());
        assert!(cost.value() < initial);
    }
    Ok(())
}
