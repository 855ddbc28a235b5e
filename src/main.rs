use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    envertech_bridge::run().await
}
