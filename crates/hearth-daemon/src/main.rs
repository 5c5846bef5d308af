use anyhow::Result;

use hearth_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("hearth-daemon")?;
    hearth_daemon::server::run().await
}
