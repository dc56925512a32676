use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn write_stays(path: &Path, n: usize) {
    let mut text = String::from("icustay_id,hospital_expire_flag,risk,heart_rate,sofa\n");
    for i in 0..n {
        let sofa = (i * 7) % 15;
        let heart_rate = 70 + (i * 13) % 60;
        let died = u8::from((i * 31) % 100 < sofa * 6);
        let risk = sofa as f64 / 20.0;
        writeln!(text, "{},{died},{risk:.3},{heart_rate},{sofa}", 1000 + i).unwrap();
    }
    fs::write(path, text).unwrap();
}

#[test]
fn train_predict_and_evaluate_round_trip() {
    let tmp = tempdir().expect("temporary directory");
    let data_path = tmp.path().join("stays.csv");
    write_stays(&data_path, 150);

    let config_path = tmp.path().join("acuity.toml");
    fs::write(
        &config_path,
        "folds = 3\ncohorts = [\"full\", \"high_risk\"]\n\n[linear]\nc_grid = [0.1, 1.0]\n\n\
         [boosted.space]\nn_estimators = [5, 10]\nmax_depth = [1, 2]\n",
    )
    .expect("write config");

    let exe = env!("CARGO_BIN_EXE_acuity");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "train",
            data_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
            "--model-dir",
            "out",
            "--n-iter",
            "2",
            "--scoring",
            "neg_log_loss",
        ])
        .status()
        .expect("run acuity train");
    assert!(status.success(), "train exited with status {status:?}");

    let model_dir = tmp.path().join("out");
    for name in [
        "full_logistic.toml",
        "full_boosted.toml",
        "high_risk_logistic.toml",
        "high_risk_boosted.toml",
        "cv_report.tsv",
    ] {
        assert!(model_dir.join(name).exists(), "{name} missing");
    }
    assert!(!model_dir.join("control_logistic.toml").exists());

    let model_path = model_dir.join("full_logistic.toml");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "predict",
            data_path.to_str().expect("path str"),
            "--model",
            model_path.to_str().expect("path str"),
            "--output",
            "scores.tsv",
        ])
        .status()
        .expect("run acuity predict");
    assert!(status.success(), "predict exited with status {status:?}");

    let predictions = fs::read_to_string(tmp.path().join("scores.tsv")).expect("read predictions");
    let mut lines = predictions.lines();
    assert_eq!(lines.next(), Some("icustay_id\tprobability"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 150);
    for row in rows {
        let (_, p) = row.split_once('\t').expect("two columns");
        let p: f64 = p.parse().expect("numeric probability");
        assert!((0.0..=1.0).contains(&p));
    }

    let output = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "evaluate",
            data_path.to_str().expect("path str"),
            "--model",
            model_path.to_str().expect("path str"),
            "--n-bootstraps",
            "100",
        ])
        .output()
        .expect("run acuity evaluate");
    assert!(output.status.success(), "evaluate failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("AUC"));
    assert!(stdout.contains("Observed:predicted ratio"));
}

#[test]
fn missing_outcome_column_is_reported() {
    let tmp = tempdir().expect("temporary directory");
    let data_path = tmp.path().join("broken.tsv");
    let mut text = String::from("icustay_id\trisk\tsofa\n");
    for i in 0..20 {
        writeln!(text, "{i}\t0.2\t{}", i % 5).unwrap();
    }
    fs::write(&data_path, text).expect("write data");

    let output = Command::new(env!("CARGO_BIN_EXE_acuity"))
        .current_dir(tmp.path())
        .args(["train", data_path.to_str().expect("path str")])
        .output()
        .expect("run acuity train");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("hospital_expire_flag"), "stderr: {stderr}");
}
