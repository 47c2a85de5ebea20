fn main() {
    println!("cargo:rerun-if-changed=src/linker.ld");
    println!("cargo:rerun-if-changed=src/entry.asm");
    println!(
        "cargo:rustc-link-arg-bins=-T{}/src/linker.ld",
        env!("CARGO_MANIFEST_DIR")
    );
}
