//! Integration tests driving the molsieve binary against a scratch store.

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

struct Fixture {
    home: TempDir,
    store: TempDir,
    shm: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            home: TempDir::new().expect("Failed to create temp dir"),
            store: TempDir::new().expect("Failed to create temp dir"),
            shm: TempDir::new().expect("Failed to create temp dir"),
        };
        // Keep shared regions inside the fixture
        let config = format!(
            r#"{{ "fp_bytes": 2, "block_rows": 4, "storage": {{ "shared": {{ "shm_dir": {:?} }} }} }}"#,
            fixture.shm.path().display().to_string()
        );
        fs::write(fixture.store.path().join("molsieve.json"), config)
            .expect("Failed to write store config");
        fixture
    }

    fn run(&self, args: &[&str]) -> (String, String, bool) {
        let output = Command::new(env!("CARGO_BIN_EXE_molsieve"))
            .args(args)
            .arg("--store")
            .arg(self.store.path())
            .env("XDG_DATA_HOME", self.home.path())
            .env("HOME", self.home.path())
            .env("RUST_LOG", "warn")
            .output()
            .expect("Failed to run molsieve");

        (
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.success(),
        )
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let (stdout, stderr, ok) = self.run(args);
        assert!(ok, "molsieve {:?} failed: {}", args, stderr);
        stdout
    }

    fn write_input(&self, name: &str, content: &str) -> String {
        let path = self.home.path().join(name);
        fs::write(&path, content).expect("Failed to write input");
        path_arg(&path)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

const RECORDS: &str = "1f00\tCCCCC\n0300\tCC\nff01\tc1ccccc1CCC\n0700\tCCC\n0100\tC\n";

#[test]
fn test_create_load_search() {
    let fx = Fixture::new();
    fx.run_ok(&["create"]);
    let input = fx.write_input("records.tsv", RECORDS);
    let stdout = fx.run_ok(&["load", &input, "--quiet"]);
    assert!(stdout.contains("Loaded 5 records"), "{}", stdout);

    let stdout = fx.run_ok(&["search", "0700", "--no-color"]);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["0\tCCCCC", "2\tc1ccccc1CCC", "3\tCCC"]);
}

#[test]
fn test_create_twice_fails() {
    let fx = Fixture::new();
    fx.run_ok(&["create"]);
    let (_, stderr, ok) = fx.run(&["create"]);
    assert!(!ok);
    assert!(stderr.contains("already exists"), "{}", stderr);
}

#[test]
fn test_fetch_and_remove() {
    let fx = Fixture::new();
    fx.run_ok(&["create"]);
    let input = fx.write_input("records.tsv", RECORDS);
    fx.run_ok(&["load", &input, "--quiet"]);

    assert_eq!(fx.run_ok(&["fetch", "1"]).trim(), "CC");
    fx.run_ok(&["remove", "1", "4"]);

    let (_, _, ok) = fx.run(&["fetch", "1"]);
    assert!(!ok);
    let stdout = fx.run_ok(&["search", "0100", "--no-color"]);
    let ids: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.split('\t').next())
        .collect();
    assert_eq!(ids, vec!["0", "2", "3"]);
}

#[test]
fn test_stats_json() {
    let fx = Fixture::new();
    fx.run_ok(&["create"]);
    let input = fx.write_input("records.tsv", RECORDS);
    fx.run_ok(&["load", &input, "--quiet"]);

    let stdout = fx.run_ok(&["stats", "--json"]);
    let stats: serde_json::Value = serde_json::from_str(&stdout).expect("stats is JSON");
    assert_eq!(stats["records"], 5);
    assert_eq!(stats["fp_bytes"], 2);
    // Four rows fill one block, the fifth is flushed as a partial block
    assert_eq!(stats["blocks"], 2);
}

#[test]
fn test_search_rejects_bad_query() {
    let fx = Fixture::new();
    fx.run_ok(&["create"]);
    let (_, _, ok) = fx.run(&["search", "xyz"]);
    assert!(!ok);
    let (_, _, ok) = fx.run(&["search", "010203"]);
    assert!(!ok);
}
