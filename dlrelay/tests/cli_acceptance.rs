use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    work: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let work = base.join("work");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(xdg_config.join("dlrelay")).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::create_dir_all(&work).expect("failed to create work dir");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_config,
            xdg_state,
            work,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(self.xdg_config.join("dlrelay/config.toml"), content)
            .expect("failed to write config");
    }

    fn write_pushes(&self, lines: &[&str]) -> PathBuf {
        let path = self.work.join("pushes.jsonl");
        fs::write(&path, lines.join("\n")).expect("failed to write pushes");
        path
    }
}

const BASE_CONFIG: &str = r#"
[relay]
measurement_id = "G-CLI"
server_container_url = "https://sst.example.com/"
"#;

fn run(env: &CliTestEnv, args: &[&str], vars: &[(&str, &str)]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("dlrelay"));
    let mut command = Command::new(bin_path);

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("GA4_PROPERTY")
        .env_remove("SERVER_CONTAINER_URL")
        .env_remove("PORT")
        .env_remove("RUST_LOG");
    for (key, value) in vars {
        command.env(key, value);
    }

    command
        .output()
        .unwrap_or_else(|e| panic!("failed to execute dlrelay: {e}"))
}

fn stdout_of(args: &[&str], output: &Output) -> String {
    assert!(
        output.status.success(),
        "dlrelay {:?} failed\nstdout:\n{}\nstderr:\n{}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_reports_resolved_configuration() {
    let env = CliTestEnv::new();
    env.write_config(BASE_CONFIG);

    let args = ["status"];
    let stdout = stdout_of(&args, &run(&env, &args, &[]));

    assert!(stdout.contains("Measurement ID:  G-CLI"), "{stdout}");
    assert!(stdout.contains("Endpoint:        https://sst.example.com\n"), "{stdout}");
    assert!(
        stdout.contains("Script URL:      https://sst.example.com/gtag/js?id=G-CLI"),
        "{stdout}"
    );
    assert!(stdout.contains("Dispatch:        immediate"), "{stdout}");
}

#[test]
fn status_without_config_uses_defaults_and_env() {
    let env = CliTestEnv::new();

    let args = ["status"];
    let stdout = stdout_of(&args, &run(&env, &args, &[("GA4_PROPERTY", "G-ENV")]));

    assert!(stdout.contains("Measurement ID:  G-ENV"), "{stdout}");
    assert!(
        stdout.contains("Script URL:      https://www.googletagmanager.com/gtag/js?id=G-ENV"),
        "{stdout}"
    );
}

#[test]
fn shape_prints_outbound_parameters() {
    let env = CliTestEnv::new();
    env.write_config(BASE_CONFIG);

    let args = [
        "shape",
        r#"{"event":"click","page_title":"Home","label":"x","gtm.start":1}"#,
    ];
    let stdout = stdout_of(&args, &run(&env, &args, &[]));

    assert!(stdout.contains("event: click"), "{stdout}");
    assert!(stdout.contains(r#""page_title": "Home""#), "{stdout}");
    assert!(stdout.contains(r#""datalayer": "{\"label\":\"x\"}""#), "{stdout}");
    assert!(stdout.contains(r#""send_to": "G-CLI""#), "{stdout}");
    assert!(!stdout.contains("gtm.start"), "{stdout}");
}

#[test]
fn shape_reports_blocked_and_data_only_records() {
    let env = CliTestEnv::new();

    let args = ["shape", r#"{"event":"gtm.js"}"#];
    let stdout = stdout_of(&args, &run(&env, &args, &[]));
    assert!(stdout.contains(r#"blocked: "gtm.js""#), "{stdout}");

    let args = ["shape", r#"{"user_type":"member"}"#];
    let stdout = stdout_of(&args, &run(&env, &args, &[]));
    assert!(stdout.contains("data-only push"), "{stdout}");
}

#[test]
fn replay_dry_run_sends_in_order() {
    let env = CliTestEnv::new();
    env.write_config(BASE_CONFIG);
    let file = env.write_pushes(&[
        r#"{"event":"early"}"#,
        r#"{"consent":"granted"}"#,
        r#"{"event":"gtm.js"}"#,
        r#"{"event":"late","value":3}"#,
    ]);

    let file = file.to_string_lossy().into_owned();
    let args = ["replay", file.as_str(), "--preloaded", "2", "--dry-run"];
    let stdout = stdout_of(&args, &run(&env, &args, &[]));

    let js = stdout.find(r#"gtag("js""#).expect("js call");
    let config = stdout
        .find(r#"gtag("config", "G-CLI", {"send_page_view":false,"transport_url":"https://sst.example.com"})"#)
        .expect("config call");
    let early = stdout.find(r#"gtag("event", "early""#).expect("early event");
    let late = stdout
        .find(r#"gtag("event", "late", {"value":3,"send_to":"G-CLI"})"#)
        .expect("late event");
    assert!(js < config && config < early && early < late, "{stdout}");

    assert!(stdout.contains("processed:   3"), "{stdout}");
    assert!(stdout.contains("blocked:     1"), "{stdout}");
    assert!(stdout.contains("queued:      1"), "{stdout}");
    assert!(stdout.contains("sent:        2"), "{stdout}");
    assert!(!stdout.contains("Handle writes:"), "{stdout}");
}

#[test]
fn replay_with_guard_prints_audit_log() {
    let env = CliTestEnv::new();
    env.write_config(&format!("{BASE_CONFIG}\n[guard]\nenabled = true\n"));
    let file = env.write_pushes(&[r#"{"event":"page_view"}"#]);

    let file = file.to_string_lossy().into_owned();
    let args = ["replay", file.as_str(), "--dry-run"];
    let stdout = stdout_of(&args, &run(&env, &args, &[]));

    assert!(stdout.contains("Handle writes:"), "{stdout}");
    assert!(stdout.contains("placeholder"), "{stdout}");
    assert!(stdout.contains("stdout"), "{stdout}");
    assert!(!stdout.contains("external"), "{stdout}");
}

#[test]
fn replay_rejects_invalid_json() {
    let env = CliTestEnv::new();
    let file = env.write_pushes(&[r#"{"event":"ok"}"#, "{not json"]);

    let file = file.to_string_lossy().into_owned();
    let output = run(&env, &["replay", file.as_str(), "--dry-run"], &[]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(":2: invalid JSON"), "{stderr}");
}

#[test]
fn invalid_config_is_rejected() {
    let env = CliTestEnv::new();
    env.write_config("[relay]\nmeasurement_id = \"\"\n");

    let output = run(&env, &["status"], &[]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("measurement_id"), "{stderr}");
}
