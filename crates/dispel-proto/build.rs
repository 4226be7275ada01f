fn main() -> Result<(), Box<dyn std::error::Error>> {
    let build_client = std::env::var("CARGO_FEATURE_CLIENT").is_ok();

    tonic_prost_build::configure()
        .build_server(false)
        .build_client(build_client)
        .build_transport(false)
        .compile_protos(
            &[
                "../../proto/console/v1/user.proto",
                "../../proto/console/v1/character.proto",
                "../../proto/console/v1/game.proto",
                "../../proto/console/v1/ranking.proto",
            ],
            &["../../proto"],
        )?;
    Ok(())
}
