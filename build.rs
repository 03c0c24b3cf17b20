fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Gather build-time info for the command line interface.
    built::write_built_file().expect("Failed to acquire build-time information");
}
