//! Build script for the SMS engine crate.
//!
//! Migration SQL is embedded at compile time via `include_str!`, so Cargo
//! needs to know to rebuild when a migration file changes even though
//! nothing under `migrations/` is referenced from `Cargo.toml` itself.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
