use std::io::Result;

fn main() -> Result<()> {
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(&["proto/exchange.proto"], &["proto/"])?;
    Ok(())
}
