//! Process-level tests driving the real ctl binary.
//!
//! These cover the contracts only visible across process boundaries:
//! the singleton exit code, waking a dead peer from the registry, and
//! stale-entry pruning. Each test gets its own scratch home and runtime
//! directory; every child process is pointed at them through the
//! environment, so nothing touches the user's real registry.

use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::Value;

const BIN: &str = env!("CARGO_BIN_EXE_neverliie-ctl");

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("neverliie-e2e-{}-{tag}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

fn ctl(home: &PathBuf, args: &[&str]) -> Result<Output> {
    Command::new(BIN)
        .args(args)
        .env("NEVERLIIE_HOME", home)
        .env("NEVERLIIE_RUNTIME_DIR", home)
        .output()
        .with_context(|| format!("failed to run neverliie-ctl {args:?}"))
}

fn spawn_serve(home: &PathBuf, name: &str) -> Child {
    Command::new(BIN)
        .args(["serve", name])
        .env("NEVERLIIE_HOME", home)
        .env("NEVERLIIE_RUNTIME_DIR", home)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn serve")
}

/// Poll `ping` until the peer answers or the budget runs out.
fn wait_alive(home: &PathBuf, name: &str, budget: Duration) -> Result<()> {
    let started = Instant::now();
    while started.elapsed() < budget {
        if ctl(home, &["ping", name])?.status.success() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("{name} never came alive")
}

fn wait_dead(home: &PathBuf, name: &str, budget: Duration) -> Result<()> {
    let started = Instant::now();
    while started.elapsed() < budget {
        if !ctl(home, &["ping", name])?.status.success() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("{name} never went offline")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn second_instance_exits_zero_and_leaves_the_first_alone() {
    let home = scratch_dir("singleton");
    let name = "e2e-singleton";
    let mut first = spawn_serve(&home, name);

    let result = (|| -> Result<()> {
        wait_alive(&home, name, Duration::from_secs(5))?;

        let started = Instant::now();
        let mut second = spawn_serve(&home, name);
        let status = loop {
            if let Some(status) = second.try_wait()? {
                break status;
            }
            if started.elapsed() > Duration::from_secs(2) {
                second.kill().ok();
                bail!("duplicate instance did not exit");
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        assert_eq!(status.code(), Some(0), "a duplicate is not an error");
        assert!(started.elapsed() < Duration::from_secs(2));

        // The survivor still answers.
        assert!(ctl(&home, &["ping", name])?.status.success());
        Ok(())
    })();

    first.kill().ok();
    result.unwrap();
}

#[test]
fn wake_relaunches_a_dead_peer_from_the_registry() {
    let home = scratch_dir("wake");
    let name = "e2e-wake";
    let mut original = spawn_serve(&home, name);

    let result = (|| -> Result<()> {
        wait_alive(&home, name, Duration::from_secs(5))?;

        // Kill it hard; the stale endpoint file stays behind.
        original.kill()?;
        original.wait()?;
        wait_dead(&home, name, Duration::from_secs(2))?;

        let woke = ctl(&home, &["wake", name, "5"])?;
        assert!(
            woke.status.success(),
            "wake failed: {}",
            String::from_utf8_lossy(&woke.stderr)
        );
        wait_alive(&home, name, Duration::from_secs(2))?;

        // Exercise the relaunched peer, then ask it to leave.
        let sum = ctl(&home, &["call", name, "add", "2", "3"])?;
        assert!(stdout_of(&sum).contains("5"), "add output: {}", stdout_of(&sum));
        let _ = ctl(&home, &["call", name, "quit"]);
        Ok(())
    })();

    original.kill().ok();
    result.unwrap();
}

#[test]
fn wake_of_unknown_peer_fails_offline() {
    let home = scratch_dir("unknown");
    let output = ctl(&home, &["wake", "e2e-never-registered", "1"]).unwrap();
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("offline"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn wake_prunes_a_registry_entry_whose_image_is_gone() {
    let home = scratch_dir("prune");
    let name = "e2e-pruned";

    // A registry entry pointing at an image that no longer exists.
    let registry = home.join("registry.json");
    let gone = home.join("deleted-binary");
    let entry = serde_json::json!({
        "type": "binary",
        "cmd": [gone.to_string_lossy()],
        "cwd": "/tmp",
    });
    let mut map = serde_json::Map::new();
    map.insert(name.to_string(), entry);
    std::fs::write(
        &registry,
        serde_json::to_string_pretty(&Value::Object(map)).unwrap(),
    )
    .unwrap();

    let output = ctl(&home, &["wake", name, "1"]).unwrap();
    assert!(!output.status.success());

    let text = std::fs::read_to_string(&registry).unwrap();
    let map: Value = serde_json::from_str(&text).unwrap();
    assert!(map.get(name).is_none(), "stale entry must be pruned: {text}");
}

#[test]
fn call_and_stream_against_a_live_peer() {
    let home = scratch_dir("calls");
    let name = "e2e-calls";
    let mut peer = spawn_serve(&home, name);

    let result = (|| -> Result<()> {
        wait_alive(&home, name, Duration::from_secs(5))?;

        let sum = ctl(&home, &["call", name, "add", "2", "3"])?;
        assert!(sum.status.success());
        assert!(stdout_of(&sum).trim().contains("5"), "add output: {}", stdout_of(&sum));

        let counted = ctl(&home, &["stream", name, "count", "3"])?;
        assert!(counted.status.success());
        let counted_stdout = stdout_of(&counted);
        let lines: Vec<&str> = counted_stdout.lines().map(str::trim).collect();
        assert_eq!(lines, vec!["1", "2", "3"]);

        let missing = ctl(&home, &["call", name, "xyz"])?;
        assert!(!missing.status.success());
        assert!(
            String::from_utf8_lossy(&missing.stderr).contains("method not found"),
            "stderr: {}",
            String::from_utf8_lossy(&missing.stderr)
        );
        Ok(())
    })();

    peer.kill().ok();
    result.unwrap();
}

#[test]
fn registry_listing_shows_live_peers() {
    let home = scratch_dir("peers");
    let name = "e2e-listed";
    let mut peer = spawn_serve(&home, name);

    let result = (|| -> Result<()> {
        wait_alive(&home, name, Duration::from_secs(5))?;

        let listed = ctl(&home, &["peers"])?;
        assert!(listed.status.success());
        assert!(stdout_of(&listed).contains(name), "peers output: {}", stdout_of(&listed));

        let forgotten = ctl(&home, &["forget", name])?;
        assert!(forgotten.status.success());
        let listed = ctl(&home, &["peers"])?;
        assert!(!stdout_of(&listed).contains(name));
        Ok(())
    })();

    peer.kill().ok();
    result.unwrap();
}
