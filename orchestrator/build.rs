//! Records the git revision and build date shown by `argoflow version`

use std::process::Command;

use chrono::{SecondsFormat, Utc};

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}

fn main() {
    let commit = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let tag = git(&["describe", "--exact-match", "--tags", "HEAD"]).unwrap_or_default();
    let tree_state = match git(&["status", "--porcelain", "--untracked-files=no"]) {
        Some(changes) if changes.is_empty() => "clean",
        Some(_) => "dirty",
        None => "unknown",
    };

    println!("cargo:rustc-env=ARGOFLOW_GIT_COMMIT={}", commit);
    println!("cargo:rustc-env=ARGOFLOW_GIT_TAG={}", tag);
    println!("cargo:rustc-env=ARGOFLOW_GIT_TREE_STATE={}", tree_state);
    println!(
        "cargo:rustc-env=ARGOFLOW_BUILD_DATE={}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/refs/tags");
}
