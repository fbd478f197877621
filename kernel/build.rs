fn main() {
    use std::{env, fs, path::PathBuf};

    // 只有真正交叉编译内核时才注入链接脚本。
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }

    let ld = PathBuf::from(env::var_os("OUT_DIR").unwrap()).join("linker.ld");
    fs::write(&ld, linker::SCRIPT).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-link-arg=-T{}", ld.display());
}
