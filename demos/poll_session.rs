use std::error::Error;
use std::time::Duration;

use jss_stream_sdk::control::StreamComparisonRequest;
use jss_stream_sdk::poller::SessionPoller;
use jss_stream_sdk::ControlApiClient;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let control = ControlApiClient::new()?;
        let started = control
            .start_comparison(&StreamComparisonRequest::new("ta01").with_num_episodes(2))
            .await?;
        println!("started session_id={}", started.session_id);

        let poller = SessionPoller::new(control).with_interval(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let record = poller
            .poll_until_terminal(&started.session_id, &cancel)
            .await?;
        println!(
            "session_id={} status={} progress={:.2}",
            record.session_id(),
            record.status(),
            record.progress()
        );

        Ok::<(), Box<dyn Error>>(())
    })
}
