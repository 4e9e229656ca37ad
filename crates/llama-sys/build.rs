use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rustc-check-cfg=cfg(llama_bindings)");
    println!("cargo:rerun-if-env-changed=LLAMA_PREBUILT_DIR");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_DIR");
    println!("cargo:rerun-if-changed=wrapper.h");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    let source_dir = env::var("LLAMA_CPP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| manifest_dir.join("../../vendor/llama.cpp"));

    // Two ways to find llama.cpp:
    //
    // * `LLAMA_PREBUILT_DIR` points at `lib/` + `include/` from an earlier
    //   build (the usual route for the iOS/Android app builds, where the
    //   xcframework or NDK build already produced static archives).
    // * otherwise CMake builds the sources at `LLAMA_CPP_DIR`.
    //
    // With neither available the crate compiles without bindings so that
    // the rest of the workspace (scripted engine, tests, C ABI) still builds.
    let located = if let Ok(prebuilt) = env::var("LLAMA_PREBUILT_DIR") {
        let prebuilt = PathBuf::from(prebuilt);
        assert!(
            prebuilt.exists(),
            "LLAMA_PREBUILT_DIR={} does not exist",
            prebuilt.display()
        );
        println!(
            "cargo:warning=Using prebuilt llama.cpp from {}",
            prebuilt.display()
        );
        Some((lib_dir_of(&prebuilt), prebuilt.join("include")))
    } else if source_dir.join("CMakeLists.txt").exists() {
        let dst = cmake_build(&source_dir, &target_os);
        Some((lib_dir_of(&dst), dst.join("include")))
    } else {
        None
    };

    let Some((lib_dir, include_dir)) = located else {
        println!(
            "cargo:warning=llama.cpp not found (set LLAMA_PREBUILT_DIR or LLAMA_CPP_DIR); \
             building llama-sys without bindings"
        );
        fs::write(out.join("bindings.rs"), "").expect("Failed to write empty bindings");
        println!("cargo:bindings=0");
        return;
    };

    link_libraries(&lib_dir, &target_os);
    generate_bindings(&include_dir, &source_dir, &out);

    println!("cargo:rustc-cfg=llama_bindings");
    println!("cargo:bindings=1");
}

fn lib_dir_of(root: &Path) -> PathBuf {
    if root.join("lib64").exists() {
        root.join("lib64")
    } else {
        root.join("lib")
    }
}

fn cmake_build(source_dir: &Path, target_os: &str) -> PathBuf {
    let mut cfg = cmake::Config::new(source_dir);
    cfg.define("BUILD_SHARED_LIBS", "OFF")
        .define("LLAMA_BUILD_SERVER", "OFF")
        .define("LLAMA_BUILD_TESTS", "OFF")
        .define("LLAMA_BUILD_EXAMPLES", "OFF")
        .define("LLAMA_BUILD_TOOLS", "OFF")
        .define("LLAMA_BUILD_COMMON", "OFF")
        .define("LLAMA_CURL", "OFF");

    match target_os {
        "ios" => {
            cfg.define("CMAKE_SYSTEM_NAME", "iOS")
                .define("GGML_METAL", "ON")
                .define("GGML_METAL_EMBED_LIBRARY", "ON")
                .define("GGML_OPENMP", "OFF");
            if env::var("TARGET").is_ok_and(|t| t.ends_with("-sim")) {
                cfg.define("CMAKE_OSX_SYSROOT", "iphonesimulator");
            } else {
                cfg.define("CMAKE_OSX_SYSROOT", "iphoneos");
            }
        }
        "macos" => {
            cfg.define("GGML_METAL", "ON")
                .define("GGML_METAL_EMBED_LIBRARY", "ON");
        }
        "android" => {
            let ndk = env::var("ANDROID_NDK_HOME")
                .or_else(|_| env::var("ANDROID_NDK"))
                .expect("ANDROID_NDK_HOME must be set to cross-compile llama.cpp for Android");
            let abi = match env::var("CARGO_CFG_TARGET_ARCH").as_deref() {
                Ok("aarch64") => "arm64-v8a",
                Ok("arm") => "armeabi-v7a",
                Ok("x86_64") => "x86_64",
                _ => "x86",
            };
            cfg.define(
                "CMAKE_TOOLCHAIN_FILE",
                Path::new(&ndk).join("build/cmake/android.toolchain.cmake"),
            )
            .define("ANDROID_ABI", abi)
            .define("ANDROID_PLATFORM", "android-28")
            .define("GGML_OPENMP", "OFF");
        }
        _ => {}
    }

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        cfg.define("GGML_CUDA", "ON");
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() {
        cfg.define("GGML_VULKAN", "ON");
    }

    cfg.build()
}

fn link_libraries(lib_dir: &Path, target_os: &str) {
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=llama");

    for name in ["ggml", "ggml-base", "ggml-cpu", "ggml-metal", "ggml-blas"] {
        if lib_dir.join(format!("lib{name}.a")).exists() {
            println!("cargo:rustc-link-lib=static={name}");
        }
    }

    if env::var("CARGO_FEATURE_CUDA").is_ok() && lib_dir.join("libggml-cuda.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-cuda");
        for lib in ["cuda", "cublas", "culibos", "cudart"] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() && lib_dir.join("libggml-vulkan.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-vulkan");
        println!("cargo:rustc-link-lib=vulkan");
    }

    match target_os {
        "linux" => {
            println!("cargo:rustc-link-lib=stdc++");
            println!("cargo:rustc-link-lib=m");
            println!("cargo:rustc-link-lib=pthread");
            println!("cargo:rustc-link-lib=gomp");
        }
        "macos" | "ios" => {
            for fw in ["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            println!("cargo:rustc-link-lib=c++");
        }
        "android" => {
            println!("cargo:rustc-link-lib=c++_shared");
            println!("cargo:rustc-link-lib=log");
            println!("cargo:rustc-link-lib=m");
        }
        "windows" => {
            println!("cargo:rustc-link-lib=msvcrt");
        }
        _ => {}
    }
}

fn generate_bindings(include_dir: &Path, source_dir: &Path, out: &Path) {
    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include_dir.display()));

    for extra in [source_dir.join("include"), source_dir.join("ggml/include")] {
        if extra.exists() {
            builder = builder.clang_arg(format!("-I{}", extra.display()));
        }
    }

    let bindings = builder
        .allowlist_function("llama_.*")
        .allowlist_function("ggml_.*")
        .allowlist_type("llama_.*")
        .allowlist_type("ggml_.*")
        .allowlist_var("LLAMA_.*")
        .allowlist_var("GGML_.*")
        .derive_default(true)
        .size_t_is_usize(true)
        .generate()
        .expect("Failed to generate bindings");

    bindings
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");
}
