fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = tonic_build::configure()
        .build_server(true)
        .build_client(true);

    let fds = protox::compile(
        ["proto/deviceplugin.proto", "proto/podresources.proto"],
        ["proto"],
    )?;
    config.compile_fds(fds)?;

    println!("cargo:rerun-if-changed=proto/deviceplugin.proto");
    println!("cargo:rerun-if-changed=proto/podresources.proto");

    Ok(())
}
