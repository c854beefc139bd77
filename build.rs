use std::fs;
use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    watch_git_head();

    println!("cargo:rustc-env=GIT_HASH={}", git_hash().unwrap_or_else(|| "unknown".to_string()));
}

/// Rebuild when HEAD moves so that `--version` stays accurate
fn watch_git_head() {
    if !Path::new(".git").exists() {
        return;
    }
    println!("cargo:rerun-if-changed=.git/HEAD");

    let Ok(head) = fs::read_to_string(".git/HEAD") else {
        return;
    };
    if let Some(reference) = head.strip_prefix("ref: ") {
        let ref_path = format!(".git/{}", reference.trim());
        if Path::new(&ref_path).exists() {
            println!("cargo:rerun-if-changed={}", ref_path);
        }
    }
}

fn git_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}
