use std::process::Command;

/// `APP_VERSION` is the package version, suffixed with the short commit
/// hash when built from a git checkout
fn main() {
    let version = env!("CARGO_PKG_VERSION");
    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|sha| !sha.is_empty());

    match commit {
        Some(sha) => println!("cargo:rustc-env=APP_VERSION={}+{}", version, sha),
        None => println!("cargo:rustc-env=APP_VERSION={}", version),
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
}
