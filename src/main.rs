#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = scriba_rust::run().await {
        eprintln!("scriba-rust fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
