/// Completion consumer
///
/// Pulls completion events off the dispatch channel and feeds them to the
/// coordinator, one task per event. A failing event is logged and dropped;
/// it is never redelivered.

use crate::runtime::{coordinator::Coordinator, dispatch::NodeCompletionEvent};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};

pub fn spawn_completion_consumer(
    coordinator: Arc<Coordinator>,
    mut completions: mpsc::Receiver<NodeCompletionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("📬 Completion consumer started");

        while let Some(event) = completions.recv().await {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                process_completion(&coordinator, event).await;
            });
        }

        tracing::info!("Completion consumer stopped");
    })
}

/// Apply one event; errors end here
pub async fn process_completion(coordinator: &Coordinator, event: NodeCompletionEvent) {
    tracing::debug!(
        "Completion received: {} ({:?}) for run {}",
        event.node_id,
        event.status,
        event.run_id
    );

    match coordinator.handle_completion(&event).await {
        Ok(outcome) => tracing::debug!("Completion {} applied: {:?}", event.node_id, outcome),
        Err(e) => tracing::error!(
            "❌ Error processing completion of node {} in run {}: {} - acknowledged to avoid reprocessing",
            event.node_id,
            event.run_id,
            e
        ),
    }
}
