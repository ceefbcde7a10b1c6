//! Build script for natfwd
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `natfwd --version`.

fn main() {
    // The default nft table name can be overridden by distro packagers
    println!("cargo:rerun-if-env-changed=NATFWD_DEFAULT_TABLE");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
