//! Build script for gossip-consensus
//!
//! Embeds build-time facts into the binary so that `version` can report
//! exactly which commit a master or agent was built from.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git(&["rev-parse", "--short=8", "HEAD"]);
    let git_branch = git(&["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = working_tree_dirty();

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = command_line("rustc", &["--version"]);

    let vars = [
        ("GOSSIP_GIT_HASH", git_hash.as_str()),
        ("GOSSIP_GIT_BRANCH", git_branch.as_str()),
        ("GOSSIP_GIT_DIRTY", git_dirty),
        ("GOSSIP_BUILD_TIMESTAMP", build_timestamp.as_str()),
        ("GOSSIP_TARGET", target.as_str()),
        ("GOSSIP_PROFILE", profile.as_str()),
        ("GOSSIP_RUSTC_VERSION", rustc_version.as_str()),
    ];
    for (key, value) in vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

fn git(args: &[&str]) -> String {
    command_line("git", args)
}

/// Run a command and return its trimmed stdout, or "unknown" on any failure
fn command_line(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn working_tree_dirty() -> &'static str {
    match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(output) if output.status.success() => {
            if output.stdout.is_empty() {
                "false"
            } else {
                "true"
            }
        }
        _ => "unknown",
    }
}
