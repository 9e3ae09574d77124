mod host;
mod mqtt;
mod timers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
