use std::error::Error;

use jss_stream_sdk::ControlApiClient;

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let control = ControlApiClient::new()?;

        let health = control.health().await?;
        println!(
            "status={} uptime_seconds={:.0} connections={}",
            health.status, health.uptime_seconds, health.active_connections
        );

        let stats = control.stats().await?;
        println!(
            "sessions total={} active={}",
            stats.total_sessions, stats.active_sessions
        );

        for info in control.list_sessions().await? {
            println!("{} {} {:.0}%", info.session_id, info.status, info.progress * 100.0);
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
