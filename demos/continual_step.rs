//! Continual learning loop on a toy linear regressor.
//!
//! Learns a base task, consolidates it into gradient memory, then trains on
//! a novel task with MEGA-II steps against base-task memory batches.
//!
//! Run with `RUST_LOG=gradmem=debug cargo run --example continual_step`.

use gradmem::{
    memory_split_name, Activation, ActivationSink, LayerConfig, LayerKind, LossDict, MemoryConfig,
    MemoryTrainer, Model, ObserveActivations, Parameter, ReconcilerConfig, Reconciliation,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const IN: usize = 8;
const OUT: usize = 2;

/// Inputs with regression targets.
struct Batch {
    inputs: Vec<[f32; IN]>,
    targets: Vec<[f32; OUT]>,
}

/// `y = W x`, trained with mean squared error.
struct Linear {
    weight: Vec<f32>,
    params: Vec<Parameter>,
}

impl Linear {
    fn new() -> Self {
        Self {
            weight: vec![0.0; OUT * IN],
            params: vec![Parameter::new("fc.weight", vec![OUT, IN])],
        }
    }

    fn predict(&self, x: &[f32; IN]) -> [f32; OUT] {
        let mut y = [0.0; OUT];
        for (o, out) in y.iter_mut().enumerate() {
            *out = (0..IN).map(|i| self.weight[o * IN + i] * x[i]).sum();
        }
        y
    }

    fn sgd(&mut self, lr: f32) {
        for (w, g) in self.weight.iter_mut().zip(self.params[0].grad()) {
            *w -= lr * g;
        }
    }
}

impl Model for Linear {
    type Batch = Batch;

    fn forward_backward(&mut self, batch: &Batch) -> gradmem::Result<LossDict> {
        let n = batch.inputs.len() as f32;
        let mut loss = 0.0;
        let mut grad = vec![0.0; OUT * IN];
        for (x, t) in batch.inputs.iter().zip(&batch.targets) {
            let y = self.predict(x);
            for o in 0..OUT {
                let err = y[o] - t[o];
                loss += (err * err) as f64 / n as f64;
                for i in 0..IN {
                    grad[o * IN + i] += 2.0 * err * x[i] / n;
                }
            }
        }
        self.params[0].accumulate_grad(&grad)?;
        Ok(LossDict::from([("loss_mse".to_string(), loss)]))
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

impl ObserveActivations for Linear {
    type Batch = Batch;

    fn observe(&mut self, batch: &Batch, sink: &mut dyn ActivationSink) -> gradmem::Result<()> {
        let data = batch.inputs.iter().flatten().copied().collect();
        let input = Activation::new(vec![batch.inputs.len(), IN], data)?;
        sink.record("fc", &input)
    }
}

/// Samples of a task whose inputs are nonzero only on `active`.
fn task(rng: &mut ChaCha8Rng, truth: &[f32], active: std::ops::Range<usize>, n: usize) -> Batch {
    let mut inputs = Vec::with_capacity(n);
    let mut targets = Vec::with_capacity(n);
    for _ in 0..n {
        let mut x = [0.0; IN];
        for i in active.clone() {
            x[i] = rng.gen::<f32>() * 2.0 - 1.0;
        }
        let mut t = [0.0; OUT];
        for (o, out) in t.iter_mut().enumerate() {
            *out = (0..IN).map(|i| truth[o * IN + i] * x[i]).sum();
        }
        inputs.push(x);
        targets.push(t);
    }
    Batch { inputs, targets }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gradmem=info".parse()?),
        )
        .init();

    let config = MemoryConfig {
        layers: vec![LayerConfig::new(
            "fc",
            LayerKind::Linear { in_features: IN },
            32,
            0.97,
        )],
        reconciler: ReconcilerConfig {
            seed: Some(2024),
            ..Default::default()
        },
        ..Default::default()
    };
    println!(
        "memory split for voc_2007_trainval_all1_10shot_seed0: {}",
        memory_split_name("voc_2007_trainval_all1_10shot_seed0")?
    );

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let truth: Vec<f32> = (0..OUT * IN).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
    let mut trainer = MemoryTrainer::new(Linear::new(), &config)?;

    // Base task
    for _ in 0..200 {
        let batch = task(&mut rng, &truth, 0..5, 16);
        trainer.model_mut().zero_grad();
        trainer.model_mut().forward_backward(&batch)?;
        trainer.model_mut().sgd(0.1);
    }

    let calibration = task(&mut rng, &truth, 0..5, 4);
    let base: Vec<Batch> = (0..4).map(|_| task(&mut rng, &truth, 0..5, 8)).collect();
    let updates = trainer.consolidate(&calibration, &base)?;
    println!("gpm update: {:?}", updates);
    println!("retained directions for fc: {}", trainer.gpm().retained("fc"));

    // Novel task against base memory
    let mut combined = 0;
    for step in 0..50 {
        let memory = task(&mut rng, &truth, 0..5, 8);
        let novel = task(&mut rng, &truth, 3..IN, 8);
        let report = trainer.step(&memory, &novel)?;
        if report.reconciliation.is_combined() {
            combined += 1;
        }
        trainer.model_mut().sgd(0.05);
        if step % 10 == 0 {
            if let Reconciliation::Combined { theta, angle, .. } = &report.reconciliation {
                println!("step {:>2}: theta {:.3} angle {:.3}", step, theta, angle);
            }
            println!("         metrics {:?}", report.metrics());
        }
    }
    println!("combined updates: {}/50", combined);

    Ok(())
}
