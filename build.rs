//! Build script to inject version and git SHA at compile time.
//!
//! Environment variables (set by CI or fall back to defaults):
//! - MPDR_VERSION: Version string (defaults to CARGO_PKG_VERSION)
//! - MPDR_GIT_SHA: Git commit SHA (defaults to "unknown" or git rev-parse)

use std::process::Command;

fn main() {
    let version = std::env::var("MPDR_VERSION").unwrap_or_else(|_| {
        std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into())
    });
    println!("cargo:rustc-env=MPDR_VERSION={}", version);

    let git_sha = std::env::var("MPDR_GIT_SHA").unwrap_or_else(|_| get_git_sha());
    println!("cargo:rustc-env=MPDR_GIT_SHA={}", git_sha);

    println!("cargo:rerun-if-env-changed=MPDR_VERSION");
    println!("cargo:rerun-if-env-changed=MPDR_GIT_SHA");
}

fn get_git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                String::from_utf8(o.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".into())
}
