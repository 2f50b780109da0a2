//! Build script for weave-runtime
//!
//! Merges compile-time configuration:
//! 1. Start with the library defaults in `CONFIG_PARAMS`
//! 2. If `WEAVE_CONFIG_RS` names a file, parse its `pub const` lines
//! 3. Known names from the file replace the defaults
//! 4. Write `OUT_DIR/weave_merged_config.rs`
//!
//! The user file only lists the values it changes.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// name, type, default, one-line description
type Param = (&'static str, &'static str, &'static str, &'static str);

const CONFIG_PARAMS: &[Param] = &[
    ("CONTEXTS", "usize", "4", "Execution contexts, one OS thread each"),
    ("ASYNC_QUEUE_SIZE", "usize", "4096", "Call ring capacity per context"),
    ("WORKERS_MIN", "usize", "1", "Worker fibers started at attach"),
    ("WORKERS_MAX", "usize", "64", "Hard cap on worker fibers per strand"),
    ("STACK_SIZE", "usize", "256 * 1024", "Default fiber stack size in bytes"),
    ("SPIN_LIMIT", "u32", "16", "Idle rounds before a context may block in poll"),
    ("POLL_TIMEOUT_US", "u64", "10_000", "Longest blocking poll"),
    ("STEAL_BATCH", "usize", "4", "Tasks asked for per steal"),
    ("DISTRIBUTE_THRESHOLD", "usize", "64", "Queued tasks above which a context gives work away"),
    ("DISTRIBUTE_BATCH", "usize", "32", "Most tasks moved per distribution"),
    ("WORKER_SPAWN_CYCLES", "u32", "4", "Starved rounds before another worker is spawned"),
    ("WORKER_YIELD_INTERVAL", "u32", "32", "Tasks a worker runs before yielding"),
    ("DEAD_FIBER_LIMIT", "usize", "64", "Dead fibers kept for reuse"),
    ("CACHE_LIMIT", "usize", "256", "Blocks kept per cache size class"),
    ("TIMER_BUCKETS", "usize", "256", "Timer queue buckets"),
    ("TIMER_RESOLUTION_US", "u64", "1000", "Width of one timer bucket"),
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest = Path::new(&out_dir).join("weave_merged_config.rs");

    let mut values: HashMap<&str, String> =
        CONFIG_PARAMS.iter().map(|&(name, _, default, _)| (name, default.to_string())).collect();

    println!("cargo:rerun-if-env-changed=WEAVE_CONFIG_RS");
    let user = env::var("WEAVE_CONFIG_RS").ok();
    if let Some(path) = &user {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for unknown in merge_overrides(&content, &mut values) {
                    println!("cargo:warning=unknown weave config parameter {}", unknown);
                }
                println!("cargo:warning=weave config overrides from {}", path);
            }
            Err(e) => println!("cargo:warning=cannot read WEAVE_CONFIG_RS {}: {}", path, e),
        }
    }

    fs::write(&dest, render(&values, user.is_some())).expect("write merged config");
}

/// Apply `pub const NAME: TYPE = VALUE;` lines; returns unknown names
fn merge_overrides(content: &str, values: &mut HashMap<&str, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    for (name, value) in content.lines().filter_map(split_const) {
        match CONFIG_PARAMS.iter().find(|p| p.0 == name) {
            Some(param) => {
                values.insert(param.0, value);
            }
            None => unknown.push(name),
        }
    }
    unknown
}

fn split_const(line: &str) -> Option<(String, String)> {
    let rest = line.trim().strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

fn render(values: &HashMap<&str, String>, with_user: bool) -> String {
    let mut out = String::from("// Generated by weave-runtime/build.rs\n");
    if with_user {
        out.push_str("// Includes overrides from WEAVE_CONFIG_RS\n");
    }
    for &(name, ty, _, doc) in CONFIG_PARAMS {
        out.push_str(&format!("\n/// {}\npub const {}: {} = {};\n", doc, name, ty, values[name]));
    }
    out
}
