use pagi::{AppError, AppEvent, Application, Receiver, Scope, Sender, Server, SseEvent};
use std::time::Duration;

/// Emits a numbered tick every second until the client goes away.
struct Ticker;

impl Application for Ticker {
    async fn call(
        &self,
        scope: Scope,
        mut receiver: Receiver,
        sender: Sender,
    ) -> Result<(), AppError> {
        let Scope::Sse(sse) = &scope else {
            return Ok(());
        };
        let scheduler = sse.pagi().scheduler().clone();

        sender
            .send(AppEvent::SseStart {
                status: 200,
                headers: vec![],
            })
            .await?;

        let mut tick = 0u64;
        loop {
            tick += 1;
            sender
                .send(AppEvent::SseSend(SseEvent {
                    event: Some("tick".into()),
                    data: tick.to_string(),
                    id: Some(tick.to_string()),
                    retry: None,
                }))
                .await?;

            tokio::select! {
                _ = scheduler.sleep(Duration::from_secs(1)) => {}
                event = receiver.receive() => {
                    // Disconnect (or drain) ends the stream.
                    tracing::debug!(?event, "stream ended");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), pagi::ServerError> {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind("127.0.0.1:8000")
        .application(|| Ticker)
        .build()
        .run()
}
