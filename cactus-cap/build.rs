use std::{env, path::PathBuf};

fn main() {
    println!("cargo:rerun-if-env-changed=CACTUS_LIB_DIR");

    // Only the `native` feature talks to libcactus; the default build links nothing.
    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    match env::var("CACTUS_LIB_DIR") {
        Ok(dir) => {
            let dir = PathBuf::from(dir);
            println!("cargo:rustc-link-search=native={}", dir.display());
            // Set rpath so the dynamic library resolves at runtime without DYLD/LD paths
            if target_os == "macos" || target_os == "linux" {
                println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir.display());
            }
        }
        Err(_) => {
            println!(
                "cargo:warning=CACTUS_LIB_DIR is not set; relying on the system linker path to find libcactus"
            );
        }
    }

    println!("cargo:rustc-link-lib=cactus");

    if target_os == "macos" {
        println!("cargo:rustc-link-lib=c++");
        println!("cargo:rustc-link-lib=framework=Accelerate");
    } else if target_os == "linux" {
        println!("cargo:rustc-link-lib=stdc++");
    }
}
