use std::process::Command;

fn main() {
    let version = version_from_git().unwrap_or_else(|| {
        std::env::var("GIT_COMMIT")
            .ok()
            .filter(|commit| !commit.is_empty())
            .map(|commit| format!("{}+{commit}", env!("CARGO_PKG_VERSION")))
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    });
    println!("cargo:rustc-env=PSTI_VERSION={version}");
    println!("cargo:rerun-if-env-changed=GIT_COMMIT");

    if std::path::Path::new(".git").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
        println!("cargo:rerun-if-changed=.git/refs");
    }
}

/// Tagged builds use the tag; anything else becomes a dev build of the crate version.
fn version_from_git() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let describe = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if describe.is_empty() {
        return None;
    }
    if describe.starts_with('v') && !describe.contains("-g") {
        return Some(describe.trim_start_matches('v').to_string());
    }
    Some(format!("{}-dev+{describe}", env!("CARGO_PKG_VERSION")))
}
