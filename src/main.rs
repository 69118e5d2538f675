#[tokio::main]
async fn main() -> anyhow::Result<()> {
    e2e_testkit::cli::run().await
}
