fn main() {
    println!("cargo:rerun-if-env-changed=HEARTHMUX_RELEASE_VERSION");
    let version = get_version();
    println!("cargo:rustc-env=HEARTHMUX_VERSION={}", version);

    // Declare dev_build as a valid cfg so the compiler doesn't warn about it.
    println!("cargo:rustc-check-cfg=cfg(dev_build)");

    if version.contains("-dev") {
        println!("cargo:rustc-cfg=dev_build");
    }
}

fn get_version() -> String {
    // Use HEARTHMUX_RELEASE_VERSION if set (from CI release workflow)
    if let Ok(release_version) = std::env::var("HEARTHMUX_RELEASE_VERSION") {
        return release_version;
    }

    // Fallback to Cargo.toml version for local development
    env!("CARGO_PKG_VERSION").to_string()
}
