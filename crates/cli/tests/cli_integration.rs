//! CLI integration tests.
//!
//! Uses `assert_cmd` to spawn the `bazaar` binary against the ledger
//! fixture in `crates/cli/fixtures`, checking exit codes and output.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const NORTH: &str = "5b1a6f3e-0c5e-4d8a-9a55-1f0f4b2d7c01";
const SOUTH: &str = "8e2c4b7a-3d1f-4a6b-b2c9-6a7d8e9f0a02";
const FROM: &str = "2026-01-01T00:00:00Z";
const TO: &str = "2026-02-01T00:00:00Z";

/// Commands write the ledger back, so every test works on its own copy.
fn ledger(dir: &TempDir) -> PathBuf {
    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/ledger.json");
    let copy = dir.path().join("ledger.json");
    fs::copy(source, &copy).expect("copy ledger fixture");
    copy
}

fn bazaar() -> Command {
    let mut cmd = cargo_bin_cmd!("bazaar");
    cmd.env_remove("BAZAAR_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("bazaar.toml");
    fs::write(&path, body).expect("write config");
    path
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    bazaar()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bazaar marketplace settlement tooling"));
}

#[test]
fn version_exits_0() {
    bazaar()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bazaar"));
}

// ──────────────────────────────────────────────
// 2. Settle
// ──────────────────────────────────────────────

#[test]
fn settle_reconciles_sales_and_verification_income() {
    let dir = TempDir::new().unwrap();
    bazaar()
        .args(["--quiet", "settle", "--seller", NORTH, "--from", FROM, "--to", TO])
        .arg("--ledger")
        .arg(ledger(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains("total:         300000 USD"))
        .stdout(predicate::str::contains("platform fee:  45000"))
        .stdout(predicate::str::contains("verification:  35"))
        .stdout(predicate::str::contains("payout:        255035"))
        .stdout(predicate::str::contains("orders=1").count(2));
}

#[test]
fn settle_json_output_is_machine_readable() {
    let dir = TempDir::new().unwrap();
    let out = bazaar()
        .args(["--quiet", "--output", "json", "settle", "--seller", NORTH])
        .args(["--from", FROM, "--to", TO])
        .arg("--ledger")
        .arg(ledger(&dir))
        .output()
        .expect("run bazaar");
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json stdout");
    assert_eq!(json["settlement"]["payout_amount"], 255035);
    assert_eq!(json["settlement"]["status"], "PENDING");
    assert_eq!(json["items"].as_array().map(Vec::len), Some(2));
}

#[test]
fn settle_rejects_backwards_period() {
    let dir = TempDir::new().unwrap();
    bazaar()
        .args(["settle", "--seller", NORTH, "--from", TO, "--to", FROM])
        .arg("--ledger")
        .arg(ledger(&dir))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("validation failed"));
}

#[test]
fn settle_rejects_bad_timestamp() {
    let dir = TempDir::new().unwrap();
    bazaar()
        .args(["settle", "--seller", NORTH, "--from", "yesterday", "--to", TO])
        .arg("--ledger")
        .arg(ledger(&dir))
        .assert()
        .failure()
        .stderr(predicate::str::contains("RFC 3339"));
}

#[test]
fn settle_missing_ledger_reports_error() {
    bazaar()
        .args(["--output", "json", "settle", "--seller", NORTH, "--from", FROM, "--to", TO])
        .args(["--ledger", "does/not/exist.json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("\"error\""));
}

#[test]
fn settle_all_covers_every_seller() {
    let dir = TempDir::new().unwrap();
    bazaar()
        .args(["--quiet", "settle-all", "--from", FROM, "--to", TO])
        .arg("--ledger")
        .arg(ledger(&dir))
        .assert()
        .success()
        .stdout(predicate::str::contains(NORTH))
        .stdout(predicate::str::contains(SOUTH))
        .stdout(predicate::str::contains("payout:        70400"))
        .stdout(predicate::str::contains("2 settled, 0 skipped, 0 failed"));
}

// ──────────────────────────────────────────────
// 3. Quote and config
// ──────────────────────────────────────────────

#[test]
fn quote_splits_seventy_thirty() {
    bazaar()
        .args(["quote", "--level", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "level 3: fee 500 USD (verifier 350, platform 150)",
        ));
}

#[test]
fn quote_unknown_level_fails() {
    bazaar()
        .args(["quote", "--level", "7"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("verification level 7"));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        r#"
currency = "EUR"

[verification_prices]
level_1 = 80
"#,
    );
    bazaar()
        .arg("--config")
        .arg(&config)
        .args(["quote", "--level", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("level 1: fee 80 EUR (verifier 56, platform 24)"));
}

#[test]
fn config_from_env_is_validated() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "platform_fee_rate = \"1.5\"\n");
    bazaar()
        .env("BAZAAR_CONFIG", &config)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn check_config_prints_defaults() {
    bazaar()
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("currency = \"USD\""))
        .stdout(predicate::str::contains("configuration ok"));
}

// ──────────────────────────────────────────────
// 4. Payout
// ──────────────────────────────────────────────

/// Local transfer endpoint: answers `responses` in order, one per
/// connection, and returns the `Idempotency-Key` of every request it saw.
fn transfer_endpoint(responses: Vec<String>) -> (String, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let url = format!("http://{}/transfers", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let mut keys = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(20);
        for response in responses {
            let stream = loop {
                match listener.accept() {
                    Ok((stream, _)) => break Some(stream),
                    Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                    Err(_) => break None,
                }
            };
            let Some(mut stream) = stream else { break };
            stream.set_nonblocking(false).expect("blocking");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut length = 0usize;
            let mut chunked = false;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    match name.trim().to_ascii_lowercase().as_str() {
                        "idempotency-key" => keys.push(value.trim().to_string()),
                        "content-length" => length = value.trim().parse().unwrap_or(0),
                        "transfer-encoding" => chunked = value.trim().eq_ignore_ascii_case("chunked"),
                        _ => {}
                    }
                }
            }
            if chunked {
                loop {
                    let mut size = String::new();
                    reader.read_line(&mut size).expect("chunk size");
                    let size = usize::from_str_radix(size.trim(), 16).unwrap_or(0);
                    let mut chunk = vec![0; size + 2];
                    reader.read_exact(&mut chunk).expect("chunk");
                    if size == 0 {
                        break;
                    }
                }
            } else {
                let mut body = vec![0; length];
                reader.read_exact(&mut body).expect("body");
            }
            stream.write_all(response.as_bytes()).expect("respond");
        }
        keys
    });
    (url, handle)
}

fn unavailable() -> String {
    "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
}

fn accepted(transfer_id: &str) -> String {
    let body = format!("{{\"transfer_id\":\"{transfer_id}\"}}");
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn settlements_in(ledger: &Path) -> Vec<serde_json::Value> {
    let text = fs::read_to_string(ledger).expect("read ledger");
    let json: serde_json::Value = serde_json::from_str(&text).expect("ledger json");
    json["settlements"].as_array().cloned().unwrap_or_default()
}

#[test]
fn settle_writes_back_and_refuses_a_second_run() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    let settle = || {
        let mut cmd = bazaar();
        cmd.args(["settle", "--seller", NORTH, "--from", FROM, "--to", TO])
            .arg("--ledger")
            .arg(&ledger);
        cmd
    };
    settle().arg("--quiet").assert().success();
    assert_eq!(settlements_in(&ledger).len(), 1);

    settle()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("settlement already exists for period"));
    assert_eq!(settlements_in(&ledger).len(), 1);
}

#[test]
fn payout_rerun_reuses_settlement_and_idempotency_key() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    let config = write_config(&dir, "[payout_retry]\nmax_attempts = 1\n");
    let (endpoint, server) = transfer_endpoint(vec![unavailable(), accepted("tr_cli_1")]);
    let payout = || {
        let mut cmd = bazaar();
        cmd.arg("--config")
            .arg(&config)
            .args(["payout", "--seller", NORTH, "--from", FROM, "--to", TO])
            .args(["--endpoint", endpoint.as_str()])
            .arg("--ledger")
            .arg(&ledger);
        cmd
    };

    payout()
        .assert()
        .failure()
        .stderr(predicate::str::contains("external dependency failed"));
    let after_failure = settlements_in(&ledger);
    assert_eq!(after_failure.len(), 1);
    assert_eq!(after_failure[0]["status"], "FAILED");

    payout()
        .assert()
        .success()
        .stdout(predicate::str::contains("transfer:      tr_cli_1"))
        .stdout(predicate::str::contains("status:        PAID"))
        // Delivered through the notification outbox to the log sink.
        .stderr(predicate::str::contains("settlement_paid"));
    let after_success = settlements_in(&ledger);
    assert_eq!(after_success.len(), 1);
    assert_eq!(after_success[0]["id"], after_failure[0]["id"]);
    assert_eq!(after_success[0]["status"], "PAID");

    let keys = server.join().expect("endpoint thread");
    assert_eq!(keys.len(), 2);
    assert!(keys[0].starts_with("settlement-"));
    assert_eq!(keys[0], keys[1]);

    // Already paid: nothing is sent again.
    payout()
        .assert()
        .failure()
        .stderr(predicate::str::contains("illegal settlement transition PAID -> PROCESSING"));
}

#[test]
fn payout_without_account_is_a_business_rule_error() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger(&dir);
    bazaar()
        .args(["--quiet", "payout", "--seller", SOUTH, "--from", FROM, "--to", TO])
        .args(["--endpoint", "http://127.0.0.1:9/transfers"])
        .arg("--ledger")
        .arg(&ledger)
        .assert()
        .failure()
        .code(1);

    // The second run picks up the pending settlement the first one saved.
    bazaar()
        .args(["payout", "--seller", SOUTH, "--from", FROM, "--to", TO])
        .args(["--endpoint", "http://127.0.0.1:9/transfers"])
        .arg("--ledger")
        .arg(&ledger)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no payout account"));
    let settlements = settlements_in(&ledger);
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0]["status"], "PENDING");
}

#[test]
fn unreachable_provider_is_an_external_failure() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[payout_retry]\nmax_attempts = 1\n");
    bazaar()
        .arg("--config")
        .arg(&config)
        .args(["payout", "--seller", NORTH, "--from", FROM, "--to", TO])
        .args(["--endpoint", "http://127.0.0.1:9/transfers"])
        .arg("--ledger")
        .arg(ledger(&dir))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("external dependency failed"));
}
