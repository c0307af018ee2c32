#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn achv_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_achv") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/achv");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "achievement-ledger-cli", "--bin", "achv"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build achv binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn schema_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../contracts/v1/schemas")
}

struct Workspace {
    document_db: PathBuf,
    reference_db: PathBuf,
    upload_dir: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tag = Ulid::new();
        let tmp = std::env::temp_dir();
        Self {
            document_db: tmp.join(format!("achv-contract-docs-{tag}.sqlite3")),
            reference_db: tmp.join(format!("achv-contract-refs-{tag}.sqlite3")),
            upload_dir: tmp.join(format!("achv-contract-uploads-{tag}")),
        }
    }

    fn output(&self, credential: Option<&str>, args: &[&str]) -> Output {
        let mut command = Command::new(achv_binary_path());
        command
            .arg("--document-db")
            .arg(&self.document_db)
            .arg("--reference-db")
            .arg(&self.reference_db)
            .arg("--upload-dir")
            .arg(&self.upload_dir)
            .env_remove("ACHIEVEMENT_CREDENTIAL")
            .env("RUST_LOG", "off");
        if let Some(credential) = credential {
            command.arg("--as").arg(credential);
        }
        for arg in args {
            command.arg(arg);
        }

        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run achv command {:?}: {err}", args),
        }
    }

    fn json(&self, credential: Option<&str>, args: &[&str]) -> Value {
        let output = self.output(credential, args);
        assert!(
            output.status.success(),
            "achv {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        stdout_json(&output)
    }

    fn add_user(&self, credential: &str, full_name: &str, role: &str) -> String {
        let user = self.json(
            None,
            &[
                "directory",
                "add-user",
                "--credential",
                credential,
                "--full-name",
                full_name,
                "--role",
                role,
            ],
        );
        string_field(&user, "user_id")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.document_db);
        let _ = fs::remove_file(&self.reference_db);
        let _ = fs::remove_dir_all(&self.upload_dir);
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

fn string_field(value: &Value, key: &str) -> String {
    match value[key].as_str() {
        Some(raw) => raw.to_string(),
        None => panic!("expected string field {key} in {value}"),
    }
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = schema_dir().join(schema_name);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

/// Registers an advisor, an advised student and an admin.
fn seeded_workspace() -> Workspace {
    let ws = Workspace::new();
    let advisor_user = ws.add_user("bob", "Bob Lecturer", "advisor");
    let lecturer = ws.json(
        None,
        &[
            "directory",
            "add-lecturer",
            "--user-id",
            &advisor_user,
            "--number",
            "L-001",
            "--department",
            "Informatics",
        ],
    );
    let lecturer_id = string_field(&lecturer, "lecturer_id");

    let student_user = ws.add_user("alice", "Alice Student", "student");
    ws.json(
        None,
        &[
            "directory",
            "add-student",
            "--user-id",
            &student_user,
            "--number",
            "S-001",
            "--program",
            "Informatics",
            "--year",
            "2023",
            "--advisor-id",
            &lecturer_id,
        ],
    );
    ws.add_user("root", "Administrator", "admin");
    ws
}

fn create_robotics_cup(ws: &Workspace) -> Value {
    ws.json(
        Some("alice"),
        &[
            "achievement",
            "create",
            "--type",
            "competition",
            "--title",
            "Robotics Cup",
            "--description",
            "National robotics championship",
            "--details-json",
            r#"{"competition_level":"national","rank":1}"#,
            "--tag",
            "robotics",
            "--points",
            "30",
        ],
    )
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(achv_binary_path()).args(["--help"]).output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["db", "directory", "achievement", "report", "consistency"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }

    let output = match Command::new(achv_binary_path())
        .args(["achievement", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "create", "update", "delete", "submit", "verify", "reject", "attach", "list", "show",
        "history",
    ] {
        assert!(
            stdout.contains(required),
            "expected achievement help to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn create_and_lifecycle_outputs_match_view_schema() {
    let ws = seeded_workspace();

    let created = create_robotics_cup(&ws);
    assert_schema("achievement-view.schema.json", &created);
    assert_eq!(created["status"], Value::String("draft".to_string()));
    assert_eq!(created["details"]["rank"], Value::Number(1_u64.into()));
    assert_eq!(
        created["owner"]["full_name"],
        Value::String("Alice Student".to_string())
    );
    let id = string_field(&created, "document_id");

    let evidence = ws.upload_dir.with_extension("pdf");
    if let Err(err) = fs::write(&evidence, b"%PDF-1.4 certificate") {
        panic!("failed to write evidence file: {err}");
    }
    let attached = ws.json(
        Some("alice"),
        &[
            "achievement",
            "attach",
            "--id",
            &id,
            "--file",
            evidence.to_str().unwrap_or(""),
        ],
    );
    let _ = fs::remove_file(&evidence);
    assert_schema("achievement-view.schema.json", &attached);
    assert_eq!(
        attached["attachments"][0]["file_type"],
        Value::String("application/pdf".to_string())
    );

    let submitted = ws.json(Some("alice"), &["achievement", "submit", "--id", &id]);
    assert_schema("achievement-view.schema.json", &submitted);
    assert_eq!(
        submitted["reference"]["status"],
        Value::String("submitted".to_string())
    );

    let verified = ws.json(Some("bob"), &["achievement", "verify", "--id", &id]);
    assert_schema("achievement-view.schema.json", &verified);
    assert_eq!(verified["status"], Value::String("verified".to_string()));
    assert!(verified.get("status_drift").is_none());

    let history = ws.json(Some("alice"), &["achievement", "history", "--id", &id]);
    let notes: Vec<&str> = history
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry["note"].as_str())
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(
        notes,
        vec![
            "verified",
            "submitted for verification",
            "achievement created"
        ]
    );
}

#[test]
fn list_output_matches_page_schema_and_filters_by_status() {
    let ws = seeded_workspace();
    let first = create_robotics_cup(&ws);
    create_robotics_cup(&ws);
    let first_id = string_field(&first, "document_id");
    ws.json(Some("alice"), &["achievement", "submit", "--id", &first_id]);

    let page = ws.json(
        Some("bob"),
        &["achievement", "list", "--page-size", "1", "--json"],
    );
    assert_schema("achievement-page.schema.json", &page);
    assert_eq!(page["total"], Value::Number(2_u64.into()));
    assert_eq!(page["total_pages"], Value::Number(2_u64.into()));

    let submitted = ws.json(
        Some("alice"),
        &["achievement", "list", "--status", "submitted", "--json"],
    );
    assert_schema("achievement-page.schema.json", &submitted);
    assert_eq!(submitted["total"], Value::Number(1_u64.into()));
    assert_eq!(
        submitted["items"][0]["document_id"],
        Value::String(first_id)
    );
}

#[test]
fn statistics_and_consistency_outputs_match_schemas() {
    let ws = seeded_workspace();
    create_robotics_cup(&ws);

    let stats = ws.json(Some("bob"), &["report", "stats"]);
    assert_schema("statistics.schema.json", &stats);
    assert_eq!(
        stats["competition_level_distribution"]["national"],
        Value::Number(1_u64.into())
    );

    let report = ws.json(Some("root"), &["consistency", "check", "--json"]);
    assert_schema("consistency-report.schema.json", &report);
    assert_eq!(report["healthy"], Value::Bool(true));
    assert_eq!(report["checked_documents"], Value::Number(1_u64.into()));
}

#[test]
fn error_shape_for_forbidden_transition_is_stable() {
    let ws = seeded_workspace();
    let created = create_robotics_cup(&ws);
    let id = string_field(&created, "document_id");

    let output = ws.output(Some("alice"), &["achievement", "verify", "--id", &id]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("forbidden"),
        "expected stable error shape, got stderr={stderr}"
    );

    let output = ws.output(Some("nobody"), &["achievement", "list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unknown credential"),
        "expected stable error shape, got stderr={stderr}"
    );
}

#[test]
fn consistency_check_is_admin_only() {
    let ws = seeded_workspace();
    let output = ws.output(Some("bob"), &["consistency", "check"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("admin"), "unexpected stderr={stderr}");
}

#[test]
fn db_migrate_reports_schema_versions() {
    let ws = Workspace::new();
    let first = ws.json(None, &["db", "migrate"]);
    assert_eq!(first["applied"], Value::Bool(true));
    assert_eq!(
        first["document_schema"]["current_version"],
        first["document_schema"]["target_version"]
    );
    assert_eq!(
        first["reference_schema"]["current_version"],
        first["reference_schema"]["target_version"]
    );

    let second = ws.json(None, &["db", "migrate"]);
    assert_eq!(second["applied"], Value::Bool(false));
}

#[test]
fn oversized_store_timeout_exits_with_usage_error() {
    let ws = Workspace::new();
    let output = ws.output(None, &["--store-timeout-ms", "3000000000", "db", "migrate"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--store-timeout-ms"), "unexpected stderr={stderr}");
    assert!(!stderr.contains("panicked"), "unexpected panic: {stderr}");
    assert!(!ws.document_db.exists());
}
