fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Upstream services are only ever dialled, never served
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(false)
        .type_attribute(".", "#[derive(serde::Serialize)]")
        .compile_protos(
            &[
                "proto/lnrpc.proto",
                "proto/xudrpc.proto",
                "proto/boltzrpc.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
