//! SQS Worker Service - Entry Point
//!
//! Runs the queue worker pool and its health server.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_sqs_worker::run().await
}
