//! Integration tests for the introvae CLI.

use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write `content` as `config.yaml` under `dir` and return its path.
fn create_test_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("introvae").expect("Failed to find introvae binary");
    cmd.args(args);
    cmd
}

fn valid_config_yaml() -> &'static str {
    r#"
dataset:
  datasets_dir: "./datasets"
  dataset: "mnist"
  shape: [28, 28]
  color: false
  train_size: 60000

model:
  latent_dim: 16
  base_filter_num: 16

loss:
  alpha: 0.25
  beta: 1.0
  margin: 20

training:
  batch_size: 50
  lr: 0.0002
  nb_epoch: 10
"#
}

/// Image shape the pooling pyramid cannot tile.
fn invalid_config_yaml() -> &'static str {
    r#"
dataset:
  datasets_dir: "./datasets"
  dataset: "odd"
  shape: [30, 30]
  train_size: 100
"#
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), valid_config_yaml());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"))
        .stdout(predicates::str::contains("Iterations: 12000"));
}

#[test]
fn test_validate_command_invalid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), invalid_config_yaml());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not divisible"));
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_train_command_help() {
    run_cli(&["train", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Start training"))
        .stdout(predicates::str::contains("CONFIG"))
        .stdout(predicates::str::contains("--resume"));
}

#[test]
fn test_train_command_missing_shards() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let yaml = format!(
        r#"
dataset:
  datasets_dir: "{}"
  dataset: "empty"
  shape: [8, 8]
  train_size: 8
training:
  batch_size: 4
  epochs: 1
"#,
        temp_dir.path().display()
    );
    let config_path = create_test_config(temp_dir.path(), &yaml);

    run_cli(&["train", config_path.to_str().unwrap()])
        .env("INTROVAE_FORCE_CPU", "1")
        .assert()
        .failure()
        .stderr(predicates::str::contains("Data"));
}

#[test]
fn test_train_command_resume_without_checkpoint() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), valid_config_yaml());
    let empty = temp_dir.path().join("checkpoints");
    fs::create_dir_all(&empty).unwrap();

    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--resume",
        empty.to_str().unwrap(),
    ])
    .assert()
    .failure()
    .stderr(predicates::str::contains("no checkpoint to resume"));
}

#[test]
fn test_init_command_help() {
    run_cli(&["init", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Generate a sample configuration"))
        .stdout(predicates::str::contains("--preset"));
}

#[test]
fn test_init_command_creates_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("test_config.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--preset", "mnist-28"])
        .assert()
        .success();

    assert!(output_path.exists(), "Config file should be created");
    let content = fs::read_to_string(&output_path).expect("Failed to read generated config");
    assert!(content.contains("dataset"));
    assert!(content.contains("latent_dim"));

    run_cli(&["validate", output_path.to_str().unwrap()])
        .assert()
        .success();
}

#[test]
fn test_init_command_unknown_preset() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("test_config.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--preset", "imagenet"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("Unknown preset"));
    assert!(!output_path.exists());
}

#[test]
fn test_cli_version() {
    run_cli(&["--version"])
        .assert()
        .success()
        .stdout(predicates::str::contains("introvae"));
}

#[test]
fn test_cli_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("introspective variational autoencoders"))
        .stdout(predicates::str::contains("validate"))
        .stdout(predicates::str::contains("train"))
        .stdout(predicates::str::contains("init"));
}
