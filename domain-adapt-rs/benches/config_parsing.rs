use criterion::{black_box, criterion_group, criterion_main, Criterion};
use domain_adapt_rs::config::AdaptConfig;
use std::io::Write;
use tempfile::NamedTempFile;

// Minimal config relying on defaults
const SMALL_YAML: &str = r#"
data:
  data_dir: ./data/cwru
  source: load0
  target: load3
"#;

// Fully specified config
const FULL_YAML: &str = r#"
data:
  data_dir: ./data/cwru
  source: load0
  target: load3
  normalize: mean-std
  val_split: 0.2
  num_classes: 10

model:
  hidden_dims: [256, 128]
  pretrained: null
  bottleneck: true
  bottleneck_num: 256
  domain_adversarial: true
  hidden_size: 1024

training:
  batch_size: 64
  devices: 1
  num_workers: 2
  drop_last: true
  opt: adam
  lr: 1.0e-3
  momentum: 0.9
  weight_decay: 1.0e-5
  lr_scheduler: step
  steps: "150, 250"
  gamma: 0.1
  middle_epoch: 50
  max_epoch: 300
  trade_off_adversarial: Step
  lam_adversarial: 1.0
  print_step: 50
  max_model_num: 5

output_dir: ./checkpoint
run_name: mlp_load0_load3
seed: 42
"#;

fn bench_config_from_yaml(c: &mut Criterion) {
    c.bench_function("config_from_yaml_small", |b| {
        b.iter(|| {
            let config: AdaptConfig = serde_yaml::from_str(black_box(SMALL_YAML)).unwrap();
            black_box(config)
        })
    });
    c.bench_function("config_from_yaml_full", |b| {
        b.iter(|| {
            let config: AdaptConfig = serde_yaml::from_str(black_box(FULL_YAML)).unwrap();
            black_box(config)
        })
    });
}

fn bench_config_validate(c: &mut Criterion) {
    let config: AdaptConfig = serde_yaml::from_str(FULL_YAML).unwrap();
    c.bench_function("config_validate", |b| {
        b.iter(|| black_box(&config).validate().unwrap())
    });

    let mut invalid = config.clone();
    invalid.training.steps = "150, x".into();
    c.bench_function("config_validate_invalid", |b| {
        b.iter(|| black_box(&invalid).validate().is_err())
    });
}

fn bench_presets(c: &mut Criterion) {
    c.bench_function("preset_cwru", |b| {
        b.iter(|| black_box(AdaptConfig::from_preset(black_box("cwru")).unwrap()))
    });
}

fn bench_config_file_io(c: &mut Criterion) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(FULL_YAML.as_bytes()).unwrap();
    file.flush().unwrap();
    c.bench_function("config_file_io", |b| {
        b.iter(|| black_box(AdaptConfig::from_file(file.path()).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_config_from_yaml,
    bench_config_validate,
    bench_presets,
    bench_config_file_io
);
criterion_main!(benches);
