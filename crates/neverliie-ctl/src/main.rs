//! neverliie-ctl — command-line diagnostics for the NeverLiie peer mesh.
//!
//! Talks to live peers over the same transport the suite uses, inspects
//! the launch registry, and can stand up a diagnostic peer (`serve`)
//! exposing a few built-in operations for poking at the mesh.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use neverliie_core::registry::{LaunchDescriptor, LaunchMode, Registry};
use neverliie_node::{client, BootError, CallArgs, PeerNode, Producer, Response};

fn usage() -> ! {
    eprintln!(
        "usage: neverliie-ctl <command> [args]\n\
         \n\
         commands:\n\
         \x20 ping   <peer>                     liveness probe (exit 1 if offline)\n\
         \x20 wake   <peer> [timeout-secs]      launch a peer from the registry\n\
         \x20 call   <peer> <method> [args..]   unary call; args parse as JSON\n\
         \x20 stream <peer> <method> [args..]   streaming call; one line per item\n\
         \x20 peers                             list registry entries\n\
         \x20 forget <peer>                     prune a registry entry\n\
         \x20 serve  <peer>                     run a diagnostic peer until Ctrl-C"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("ping") => cmd_ping(&args[1..]).await,
        Some("wake") => cmd_wake(&args[1..]).await,
        Some("call") => cmd_call(&args[1..]).await,
        Some("stream") => cmd_stream(&args[1..]).await,
        Some("peers") => cmd_peers(),
        Some("forget") => cmd_forget(&args[1..]),
        Some("serve") => cmd_serve(&args[1..]).await,
        _ => usage(),
    }
}

// ── Client commands ───────────────────────────────────────────────────────────

async fn cmd_ping(rest: &[String]) -> Result<()> {
    let name = rest.first().context("usage: neverliie-ctl ping <peer>")?;
    if client::ping(name).await {
        println!("{name} is alive");
        Ok(())
    } else {
        println!("{name} is offline");
        std::process::exit(1);
    }
}

async fn cmd_wake(rest: &[String]) -> Result<()> {
    let name = rest.first().context("usage: neverliie-ctl wake <peer> [timeout-secs]")?;
    let secs: f64 = match rest.get(1) {
        Some(raw) => raw.parse().context("timeout must be a number of seconds")?,
        None => 5.0,
    };
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("timeout must be a non-negative number of seconds");
    }

    let registry = Registry::open_default();
    client::wake(&registry, name, Duration::from_secs_f64(secs)).await?;
    println!("{name} is awake");
    Ok(())
}

async fn cmd_call(rest: &[String]) -> Result<()> {
    let name = rest.first().context("usage: neverliie-ctl call <peer> <method> [args..]")?;
    let method = rest.get(1).context("missing method name")?;
    let args = parse_values(&rest[2..]);

    let result = client::call(name, method, args, Map::new(), client::DEFAULT_CALL_TIMEOUT).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_stream(rest: &[String]) -> Result<()> {
    let name = rest.first().context("usage: neverliie-ctl stream <peer> <method> [args..]")?;
    let method = rest.get(1).context("missing method name")?;
    let args = parse_values(&rest[2..]);

    let mut stream = client::stream(name, method, args, Map::new()).await?;
    while let Some(item) = stream.next().await? {
        println!("{item}");
    }
    Ok(())
}

fn cmd_peers() -> Result<()> {
    let registry = Registry::open_default();
    let entries = registry.entries();

    println!("═══════════════════════════════════════");
    println!("  NeverLiie Registry");
    println!("═══════════════════════════════════════");
    println!("  Entries : {}", entries.len());
    println!("  File    : {}", registry.path().display());

    for (name, descriptor) in &entries {
        let mode = match descriptor.mode {
            LaunchMode::Script => "script",
            LaunchMode::Binary => "binary",
        };
        println!("\n  ┌─ {name}");
        println!("  │  type : {mode}");
        println!("  │  cmd  : {}", descriptor.cmd.join(" "));
        println!("  └─ cwd  : {}", descriptor.cwd.display());
    }
    Ok(())
}

fn cmd_forget(rest: &[String]) -> Result<()> {
    let name = rest.first().context("usage: neverliie-ctl forget <peer>")?;
    Registry::open_default().prune(name);
    println!("{name} forgotten");
    Ok(())
}

fn parse_values(raw: &[String]) -> Vec<Value> {
    // Each argument is JSON if it parses, a bare string otherwise.
    raw.iter()
        .map(|s| serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())))
        .collect()
}

// ── Diagnostic peer ───────────────────────────────────────────────────────────

/// Yields one integer every 50 ms, forever. Only cancellation ends it.
struct Drip {
    next: u64,
}

impl Producer for Drip {
    fn next(&mut self) -> anyhow::Result<Option<Value>> {
        std::thread::sleep(Duration::from_millis(50));
        let value = self.next;
        self.next += 1;
        Ok(Some(Value::from(value)))
    }
}

async fn cmd_serve(rest: &[String]) -> Result<()> {
    let name = rest.first().context("usage: neverliie-ctl serve <peer>")?;

    // Self-descriptor with arguments, so a wake brings this peer back as
    // itself rather than as a bare ctl invocation.
    let image = std::env::current_exe()?;
    let cwd = image.parent().context("executable has no parent directory")?.to_path_buf();
    let descriptor = LaunchDescriptor {
        mode: LaunchMode::Binary,
        cmd: vec![
            image.to_string_lossy().into_owned(),
            "serve".to_string(),
            name.clone(),
        ],
        cwd,
        extra: Map::new(),
    };

    let node = match PeerNode::bind_with_descriptor(name, descriptor).await {
        Ok(node) => node,
        Err(BootError::AlreadyRunning(_)) => {
            eprintln!("[neverliie] {name} is already running. Exiting.");
            std::process::exit(0);
        }
        Err(e) => return Err(e.into()),
    };

    node.expose("echo", |call: CallArgs| -> anyhow::Result<Response> {
        Ok(Response::Value(Value::Array(call.args)))
    });

    node.expose("add", |call: CallArgs| -> anyhow::Result<Response> {
        let x = call.arg(0).and_then(Value::as_f64).context("add: x must be a number")?;
        let y = call.arg(1).and_then(Value::as_f64).context("add: y must be a number")?;
        Ok(Response::value(x + y))
    });

    node.expose("count", |call: CallArgs| -> anyhow::Result<Response> {
        let n = call
            .arg(0)
            .and_then(Value::as_u64)
            .context("count: n must be a non-negative integer")?;
        Ok(Response::stream((1..=n).map(Value::from)))
    });

    node.expose("drip", |_call: CallArgs| -> anyhow::Result<Response> {
        Ok(Response::Stream(Box::new(Drip { next: 0 })))
    });

    node.expose("quit", |_call: CallArgs| -> anyhow::Result<Response> {
        // Let the reply make it onto the wire before leaving.
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(100));
            std::process::exit(0);
        });
        Ok(Response::Value(Value::Null))
    });

    println!("serving '{name}'; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
