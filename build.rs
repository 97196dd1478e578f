use std::process::Command;

/// Короткий хеш коммита, либо "unknown" вне git-дерева.
fn git_revision() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|rev| rev.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    println!("cargo:rustc-env=RELAYBUS_GIT_REVISION={}", git_revision());
    println!(
        "cargo:rustc-env=RELAYBUS_BUILD_TIME={}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );
}
