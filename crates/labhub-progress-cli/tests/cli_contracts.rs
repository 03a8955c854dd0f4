#![allow(clippy::single_match_else)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::{json, Value};
use ulid::Ulid;

fn lh_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_lh") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/lh");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "labhub-progress-cli", "--bin", "lh"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build lh binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("labhub-cli-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        let _ = fs::remove_file(candidate);
    }
}

fn lh_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(lh_binary_path());
    command
        .env_remove("LABHUB_DB")
        .env_remove("LABHUB_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run lh command {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn stderr_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stderr) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stderr as JSON: {err}\nstderr={}",
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn lh_json(db_path: &Path, args: &[&str]) -> Value {
    let output = lh_output(db_path, args);
    assert!(
        output.status.success(),
        "lh {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn lh_failure(db_path: &Path, args: &[&str]) -> Value {
    let output = lh_output(db_path, args);
    assert_eq!(output.status.code(), Some(1), "lh {args:?} should exit 1");
    assert!(output.stdout.is_empty(), "failures must not print to stdout");
    let envelope = stderr_json(&output);
    assert_schema("error-envelope.schema.json", &envelope);
    envelope
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/v1")
        .join(schema_name);
    let body = match fs::read_to_string(&schema_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read {}: {err}", schema_path.display()),
    };
    let schema: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse {}: {err}", schema_path.display()),
    };
    let compiled = match JSONSchema::compile(&schema) {
        Ok(value) => value,
        Err(err) => panic!("failed to compile {}: {err}", schema_path.display()),
    };
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {schema_name}:\n{}\nvalue={value}",
            errors.join("\n")
        );
    }
}

fn create_user(db_path: &Path, email: &str, role: &str) -> String {
    let payload = lh_json(
        db_path,
        &[
            "user",
            "create",
            "--email",
            email,
            "--first-name",
            "Henrietta",
            "--last-name",
            "Leavitt",
            "--role",
            role,
        ],
    );
    match payload["user_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("user create did not return a user_id: {payload}"),
    }
}

#[test]
fn help_lists_expected_command_groups() {
    let output = match Command::new(lh_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["user", "lab", "progress", "admin"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn three_lab_flow_emits_contract_json() {
    let db_path = temp_db("flow");
    let admin = create_user(&db_path, "admin@example.edu", "admin");
    let student = create_user(&db_path, "student@example.edu", "student");

    lh_json(
        &db_path,
        &[
            "lab", "create", "--actor", &admin, "--lab", "l1", "--name", "First Light",
            "--sequence-order", "0", "--max-bonus-points", "10",
        ],
    );
    lh_json(
        &db_path,
        &[
            "lab", "create", "--actor", &admin, "--lab", "l2", "--name", "Second Light",
            "--sequence-order", "1", "--prerequisite", "l1",
        ],
    );
    lh_json(
        &db_path,
        &[
            "lab", "create", "--actor", &admin, "--lab", "l3", "--name", "Third Light",
            "--sequence-order", "2", "--prerequisite", "l2",
        ],
    );

    let started = lh_json(&db_path, &["progress", "start", "--user", &student, "--lab", "l1"]);
    assert_eq!(started["status"], json!("in_progress"));
    assert_eq!(started["attempts"], json!(1));

    let locked = lh_json(&db_path, &["lab", "accessible", "--user", &student, "--lab", "l2"]);
    assert_eq!(locked["accessible"], json!(false));
    assert_eq!(locked["missing_prerequisites"], json!(["l1"]));

    let first = lh_json(
        &db_path,
        &[
            "progress", "complete", "--user", &student, "--lab", "l1", "--score", "90",
            "--bonus-points", "10",
        ],
    );
    assert_schema("completion-outcome.schema.json", &first);
    assert_eq!(first["user_rank"], json!("enthusiast"));

    lh_json(&db_path, &["progress", "start", "--user", &student, "--lab", "l2"]);
    let second = lh_json(
        &db_path,
        &["progress", "complete", "--user", &student, "--lab", "l2", "--score", "100"],
    );
    assert_schema("completion-outcome.schema.json", &second);
    assert_eq!(second["user_total_score"], json!(190.0));
    assert_eq!(second["user_total_bonus_points"], json!(10.0));
    assert_eq!(second["user_rank"], json!("apprentice"));

    let snapshot = lh_json(&db_path, &["progress", "show", "--user", &student]);
    assert_schema("progress-snapshot.schema.json", &snapshot);
    let statuses = snapshot["labs"]
        .as_array()
        .map(|labs| {
            labs.iter()
                .map(|entry| entry["progress"]["status"].clone())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(
        statuses,
        vec![json!("completed"), json!("completed"), json!("unlocked")]
    );

    let single = lh_json(
        &db_path,
        &["progress", "show", "--user", &student, "--lab", "l3"],
    );
    assert_eq!(single["progress"]["status"], json!("unlocked"));
    assert_eq!(single["progress"]["attempts"], json!(0));

    remove_db(&db_path);
}

#[test]
fn error_envelopes_carry_stable_codes() {
    let db_path = temp_db("errors");
    let student = create_user(&db_path, "errors@example.edu", "student");
    lh_json(&db_path, &["lab", "seed"]);

    let forbidden = lh_failure(
        &db_path,
        &["progress", "start", "--user", &student, "--lab", "seasons"],
    );
    assert_eq!(forbidden["error"]["code"], json!("progress.forbidden"));
    let message = forbidden["error"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("prerequisites not met"), "message={message}");
    assert!(message.contains("celestial-navigation"), "message={message}");

    let not_started = lh_failure(
        &db_path,
        &[
            "progress", "complete", "--user", &student, "--lab", "celestial-navigation",
            "--score", "50",
        ],
    );
    assert_eq!(not_started["error"]["code"], json!("progress.invalid_state"));

    lh_json(
        &db_path,
        &["progress", "start", "--user", &student, "--lab", "celestial-navigation"],
    );
    let out_of_bounds = lh_failure(
        &db_path,
        &[
            "progress", "complete", "--user", &student, "--lab", "celestial-navigation",
            "--score", "100.01",
        ],
    );
    assert_eq!(out_of_bounds["error"]["code"], json!("progress.validation"));

    let missing = lh_failure(
        &db_path,
        &["lab", "show", "--lab", "andromeda"],
    );
    assert_eq!(missing["error"]["code"], json!("progress.not_found"));

    let catalog_forbidden = lh_failure(
        &db_path,
        &["lab", "delete", "--actor", &student, "--lab", "tides"],
    );
    assert_eq!(catalog_forbidden["error"]["code"], json!("progress.forbidden"));

    remove_db(&db_path);
}

#[test]
fn admin_override_bypasses_bounds_and_refreshes_totals() {
    let db_path = temp_db("override");
    let instructor = create_user(&db_path, "instructor@example.edu", "instructor");
    let student = create_user(&db_path, "override@example.edu", "student");
    lh_json(&db_path, &["lab", "seed"]);
    lh_json(
        &db_path,
        &["progress", "start", "--user", &student, "--lab", "celestial-navigation"],
    );

    let outcome = lh_json(
        &db_path,
        &[
            "admin", "override", "--actor", &instructor, "--user", &student, "--lab",
            "celestial-navigation", "--score", "1000", "--notes", "extra credit",
        ],
    );
    assert_eq!(outcome["score"], json!(1000.0));
    assert_eq!(outcome["score_overridden"], json!(true));
    assert_eq!(outcome["user_total_score"], json!(1000.0));

    let view = lh_json(
        &db_path,
        &["admin", "user-progress", "--actor", &instructor, "--user", &student],
    );
    assert_schema("progress-snapshot.schema.json", &view);
    assert_eq!(view["user"]["total_score"], json!(1000.0));
    assert_eq!(view["labs"][0]["progress"]["instructor_notes"], json!("extra credit"));

    let denied = lh_failure(
        &db_path,
        &["admin", "user-progress", "--actor", &student, "--user", &instructor],
    );
    assert_eq!(denied["error"]["code"], json!("progress.forbidden"));

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open inspection connection: {err}"),
    };
    let stored: f64 = match conn.query_row(
        "SELECT total_score FROM users WHERE user_id = ?1",
        [&student],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to read stored totals: {err}"),
    };
    assert!((stored - 1000.0).abs() < f64::EPSILON);
    drop(conn);

    remove_db(&db_path);
}

#[test]
fn config_file_supplies_database_path() {
    let db_path = temp_db("config");
    let config_path =
        std::env::temp_dir().join(format!("labhub-cli-config-{}.toml", Ulid::new()));
    let body = format!("db = {:?}\nlog_filter = \"info\"\n", db_path.display().to_string());
    if let Err(err) = fs::write(&config_path, body) {
        panic!("failed to write config fixture: {err}");
    }

    let output = match Command::new(lh_binary_path())
        .env_remove("LABHUB_DB")
        .env_remove("RUST_LOG")
        .env("LABHUB_CONFIG", &config_path)
        .args(["lab", "seed"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run lh with config: {err}"),
    };
    assert!(
        output.status.success(),
        "seed via config failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(db_path.exists(), "expected database at {}", db_path.display());

    let listed = lh_json(&db_path, &["lab", "list"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(15));

    let broken = temp_db("missing-config");
    let output = match Command::new(lh_binary_path())
        .env_remove("LABHUB_DB")
        .env("LABHUB_CONFIG", broken.with_extension("toml"))
        .args(["lab", "list"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run lh with missing config: {err}"),
    };
    assert_eq!(output.status.code(), Some(1));
    let envelope = stderr_json(&output);
    assert_eq!(envelope["error"]["code"], json!("progress.configuration"));

    let _ = fs::remove_file(&config_path);
    remove_db(&db_path);
}
