#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dimse_node::cli::run().await
}
