use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=ROCM_PATH");

    // The HIP device backend is opt-in: without a ROCm install the default
    // build must still compile and run the host/mock backends.
    if env::var_os("CARGO_FEATURE_ROCM").is_some() {
        let rocm_root = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".to_string());
        println!("cargo:rustc-link-search=native={}/lib", rocm_root);
        println!("cargo:rustc-link-lib=dylib=amdhip64");
    }
}
