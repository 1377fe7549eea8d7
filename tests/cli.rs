use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn copilot_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("copilot");
    path
}

fn setup_test_env(embedding_provider: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("press-102.txt"),
        "Hydraulic specs: system pressure 3000 psi, relief valve set to 3200 psi.\x0c\
         Return hoses: use SAE 100R2 hoses with JIC fittings.\x0c",
    )
    .unwrap();
    fs::write(
        files_dir.join("loader-205.txt"),
        "Loader hydraulic hoses: SAE 100R1.\x0cEngine oil: 15W-40, capacity 18 quarts.",
    )
    .unwrap();

    let embedding = match embedding_provider {
        "hashed" => "provider = \"hashed\"\ndims = 128\n",
        _ => "provider = \"disabled\"\n",
    };
    let config_content = format!(
        r#"[db]
path = "{root}/data/copilot.sqlite"

[storage]
manuals_dir = "{root}/data/manuals"

[embedding]
{embedding}
[generation]
provider = "extractive"
"#,
        root = root.display(),
        embedding = embedding,
    );

    let config_path = config_dir.join("copilot.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_copilot(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = copilot_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run copilot binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn file(tmp: &TempDir, name: &str) -> String {
    tmp.path().join("files").join(name).display().to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("hashed");

    let (stdout, stderr, success) = run_copilot(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_copilot(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_upload_and_ask() {
    let (tmp, config_path) = setup_test_env("hashed");

    let (stdout, stderr, success) = run_copilot(
        &config_path,
        &["upload", "102", &file(&tmp, "press-102.txt"), "--description", "Press"],
    );
    assert!(success, "upload failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed unit 102: 2 pages, 2 chunks"));

    let (stdout, _, success) = run_copilot(&config_path, &["manuals"]);
    assert!(success);
    assert!(stdout.contains("102"));
    assert!(stdout.contains("indexed"));

    let (stdout, stderr, success) = run_copilot(
        &config_path,
        &["ask", "What is the relief valve setting for unit 102?"],
    );
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("[Unit 102 | press-102.txt | Page 1]"));
    assert!(stdout.contains("Sources:"));
}

#[test]
fn test_reupload_requires_replace() {
    let (tmp, config_path) = setup_test_env("hashed");
    let path = file(&tmp, "press-102.txt");

    run_copilot(&config_path, &["upload", "102", &path]);
    let (_, stderr, success) = run_copilot(&config_path, &["upload", "102", &path]);
    assert!(!success);
    assert!(stderr.contains("already registered"));

    let (stdout, _, success) = run_copilot(&config_path, &["upload", "102", &path, "--replace"]);
    assert!(success);
    assert!(stdout.contains("2 reused"));
}

#[test]
fn test_ask_plan_shows_cross_reference() {
    let (tmp, config_path) = setup_test_env("hashed");
    run_copilot(&config_path, &["upload", "102", &file(&tmp, "press-102.txt")]);
    run_copilot(&config_path, &["upload", "205", &file(&tmp, "loader-205.txt")]);

    let (stdout, _, success) = run_copilot(
        &config_path,
        &["ask", "What hoses do I need for unit 102?", "--plan"],
    );
    assert!(success);
    let plan: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(plan["direct_units"], serde_json::json!(["102"]));
    assert_eq!(plan["scan"], "cross_reference");
}

#[test]
fn test_failed_indexing_is_recorded() {
    let (tmp, config_path) = setup_test_env("disabled");

    let (_, stderr, success) =
        run_copilot(&config_path, &["upload", "102", &file(&tmp, "press-102.txt")]);
    assert!(!success);
    assert!(stderr.contains("indexing failed"));

    let (stdout, _, success) = run_copilot(&config_path, &["manuals"]);
    assert!(success);
    assert!(stdout.contains("failed"));
    assert!(tmp.path().join("data/manuals/102.txt").exists());
}

#[test]
fn test_delete_unknown_unit_fails() {
    let (_tmp, config_path) = setup_test_env("hashed");
    let (_, stderr, success) = run_copilot(&config_path, &["delete", "999"]);
    assert!(!success);
    assert!(stderr.contains("no manual registered"));
}

#[test]
fn test_stats_lists_units() {
    let (tmp, config_path) = setup_test_env("hashed");
    run_copilot(&config_path, &["upload", "205", &file(&tmp, "loader-205.txt")]);

    let (stdout, stderr, success) = run_copilot(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Chunks:      2"));
    assert!(stdout.contains("205"));
}
