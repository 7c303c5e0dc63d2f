use std::process::Command;

fn main() {
    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let build_date = chrono::Utc::now().format("%Y-%m-%d");

    println!(
        "cargo:rustc-env=CERTFLEET_LONG_VERSION={} (commit {}, built {})",
        env!("CARGO_PKG_VERSION"),
        git_hash,
        build_date
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
}
