use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hookpipe::{Engine, HookDefinition, HttpMethod, GLOBAL_TAG};

#[tokio::main]
async fn main() -> hookpipe::Result<()> {
    let engine = Arc::new(
        Engine::builder()
            .workers_count(5)
            .runner_interval(Duration::from_secs(2))
            .skip_interval(Duration::from_secs(10))
            .build(),
    );

    engine
        .register_definitions(&[HookDefinition::new(
            "order_created",
            "on order created",
            HttpMethod::Post,
            10,
        )])
        .await?;

    engine
        .create_configuration_from_definition(
            "order_created",
            "https://example.com/webhook",
            GLOBAL_TAG,
            Some("supersecret".to_string()),
        )
        .await?;

    let cancel = CancellationToken::new();
    let runner = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(cancel).await })
    };

    engine
        .schedule_json(
            None,
            "order_created",
            GLOBAL_TAG,
            &serde_json::json!({ "order_id": 123 }),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    let _ = runner.await;
    Ok(())
}
