fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc binary so no system installation is required.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/membership.proto");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/membership.proto"], &["proto"])?;

    Ok(())
}
