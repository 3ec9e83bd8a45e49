//! Stamps `smite --version` with the commit it was built from

use std::process::Command;

/// Trimmed stdout of a successful git invocation
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // Outside a checkout (crate tarballs, vendored builds) fall back to the
    // package version so the banner still says something useful.
    let release = git(&["describe", "--tags", "--abbrev=0"])
        .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")));
    let commit = git(&["describe", "--always", "--dirty", "--exclude", "*"])
        .unwrap_or_else(|| "untracked".to_string());
    let built = chrono::Utc::now().format("%Y-%m-%d").to_string();

    println!("cargo:rustc-env=SMITE_RELEASE={}", release);
    println!("cargo:rustc-env=SMITE_COMMIT={}", commit);
    println!("cargo:rustc-env=SMITE_BUILD_DATE={}", built);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-changed=build.rs");
}
