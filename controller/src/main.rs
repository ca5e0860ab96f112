#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tradfri_controller::host::run().await
}
