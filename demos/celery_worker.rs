use async_trait::async_trait;
use rabbitmq_task_worker::{ConnectionSettings, Task, TaskHandler, Worker, WorkerConfig, WorkerError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

// 1. Implement the `TaskHandler` trait for your logic
struct ArithmeticHandler;

#[async_trait]
impl TaskHandler for ArithmeticHandler {
    fn handler_name(&self) -> &str {
        "ArithmeticHandler"
    }

    async fn handle(&self, task: Task) -> Result<(), WorkerError> {
        log::info!("Received task {} ({}) with args {:?}", task.id(), task.name(), task.args());

        let numbers: Vec<i64> = task.args().iter().filter_map(Value::as_i64).collect();
        match task.name() {
            "tasks.add" => {
                task.complete(json!(numbers.iter().sum::<i64>())).await;
            }
            "tasks.mul" => {
                task.complete(json!(numbers.iter().product::<i64>())).await;
            }
            "tasks.sleep" => {
                log::info!("Simulating a long-running task...");
                tokio::time::sleep(Duration::from_secs(10)).await;
                task.complete(Value::Null).await;
            }
            other => {
                log::warn!("Unknown task '{}'", other);
                task.fail(format!("unknown task '{}'", other)).await;
            }
        }
        Ok(())
    }
}

// 2. Configure and run the worker
#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = ConnectionSettings::from_env();
    log::info!("Using RabbitMQ at {}", settings.address());

    let worker = Worker::new(settings, WorkerConfig::default());
    worker.set_task_handler(Arc::new(ArithmeticHandler)).await;

    // The worker reconnects on its own; we only decide when it stops.
    worker.start()?.wait_until_running().await;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| WorkerError::from(format!("unable to listen for Ctrl+C: {}", e)))?;
    log::info!("Ctrl+C received. Shutting down.");

    worker.stop().wait_until_terminated().await;
    worker.close().await;

    log::info!("Application has shut down.");
    Ok(())
}
