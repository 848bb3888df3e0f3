use std::error::Error;

use jss_stream_sdk::control::{AgentKind, DispatchingRule, StreamComparisonRequest};
use jss_stream_sdk::{ComparisonClient, EventKind, ServerEvent};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = ComparisonClient::with_defaults()?;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ServerEvent>();

        client
            .router()
            .on(EventKind::EpisodeProgress, |event| {
                if let ServerEvent::EpisodeProgress {
                    session_id,
                    agent_name,
                    episode,
                    current_makespan,
                    ..
                } = event
                {
                    println!("{session_id} {agent_name} episode={episode} makespan={current_makespan:?}");
                }
            });
        for kind in [EventKind::ComparisonComplete, EventKind::Error] {
            let done_tx = done_tx.clone();
            client.router().on(kind, move |event| {
                let _ = done_tx.send(event.clone());
            });
        }

        let client_id = client.connect().await?;
        println!("connected client_id={client_id}");

        let request = StreamComparisonRequest::new("ta01")
            .with_agents([AgentKind::Hybrid])
            .with_dispatching_rules([DispatchingRule::Spt, DispatchingRule::Fifo])
            .with_num_episodes(3);
        let started = client.start_session(&request).await?;
        println!("started session_id={}", started.session_id);

        if let Some(event) = done_rx.recv().await {
            println!("finished with {}", event.type_name());
        }
        if let Some(record) = client.session(&started.session_id) {
            for (method, summary) in &record.results {
                println!("{method}: best_makespan={:?}", summary.best_makespan);
            }
        }

        client.disconnect().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
