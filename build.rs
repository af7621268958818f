fn main() {
    // Embedded migrations are read at compile time
    println!("cargo:rerun-if-changed=migrations");
    println!("cargo:rerun-if-changed=build.rs");

    // Version and build metadata reported by `init()` and `/health`
    built::write_built_file()
        .expect("Failed to acquire build-time information");
}
