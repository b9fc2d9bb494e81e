fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .include_file("mod.rs")
        .compile_protos(
            &[
                "proto/opensergo/transport/v1/transport.proto",
                "proto/opensergo/fault_tolerance/v1/fault_tolerance.proto",
                "proto/opensergo/router/v1/router.proto",
                "proto/envoy/config/route/v3/route.proto",
                "proto/envoy/service/extension/v3/config_discovery.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
