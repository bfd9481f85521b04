//! Generates the CSI identity and node service stubs from `proto/csi.proto`.
//!
//! `protoc` comes from `protoc-bin-vendored`, so no system install is
//! needed. The generated code is pulled in by `src/csi.rs`.

#[allow(unsafe_code, clippy::print_stdout)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
    // SAFETY: no other thread of the build script reads the environment.
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/csi.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    Ok(())
}
