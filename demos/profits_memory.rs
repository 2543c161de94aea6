use std::time::Duration;

use chrono::NaiveDate;
use serde_json::Value;

use profits_rpc::app::{Application, Job, JobStore, ModelRegistry, Profit, COUNT_PROFITS};
use profits_rpc::{ConnectionParams, MemoryBroker, RpcConfig, RpcWorker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ---
    env_logger::init();

    let broker = MemoryBroker::new();
    let config = RpcConfig::new(ConnectionParams::default(), Duration::from_secs(10))
        .with_transport_id("profits-api");

    let worker = RpcWorker::new(broker.transport("profits-worker"), &config);
    worker.register(COUNT_PROFITS, |args: Vec<Value>, _kwargs| async move {
        let jobs: Vec<Job> = serde_json::from_value(args.into_iter().next().unwrap_or_default())?;
        let profits: Vec<Profit> = jobs
            .iter()
            .map(|job| {
                let hours = (job.completion_time - job.start_time).num_minutes() as f64 / 60.0;
                Profit {
                    id: job.id,
                    profit: hours * f64::from(job.nodes_used) * f64::from(job.passmark) / 1000.0,
                }
            })
            .collect();
        Ok::<_, profits_rpc::RpcError>(profits)
    });
    let _worker_task = worker.start().await?;

    let app = Application::start(
        &ModelRegistry::with_default_models(),
        broker.transport("profits-api"),
        config,
    )?;

    let day = NaiveDate::from_ymd_opt(2024, 3, 1).ok_or("bad date")?;
    let start = day.and_hms_opt(8, 0, 0).ok_or("bad time")?;
    app.store().insert_jobs(vec![
        Job {
            id: 1,
            start_time: start,
            completion_time: start + chrono::Duration::hours(3),
            nodes_used: 4,
            passmark: 9000,
        },
        Job {
            id: 2,
            start_time: start,
            completion_time: start + chrono::Duration::hours(1),
            nodes_used: 16,
            passmark: 12000,
        },
    ])?;

    println!("GET  /jobs    -> {}", app.jobs_handler().get().await?);
    println!("POST /profits -> {}", app.profits_handler().post().await?);
    println!("GET  /profits -> {}", app.profits_handler().get().await?);

    app.shutdown().await?;
    worker.shutdown().await?;
    Ok(())
}
