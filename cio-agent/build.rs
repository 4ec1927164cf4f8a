fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost at a vendored protoc when the system has none.
    if std::env::var_os("PROTOC").is_none() {
        // SAFETY: single-threaded build script, set before any proto compile.
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    // Compile the block-device agent proto (server side only)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/cio_agent.proto"], &["../proto"])?;

    Ok(())
}
