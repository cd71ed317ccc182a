use pagi::{
    AppError, AppEvent, Application, Body, Receiver, Scope, Sender, Server, ServerEvent, header,
    limits::WorkerLimits,
};

/// Lifespan state sharing: the counter lives in `scope.state`, seeded at
/// startup and incremented by every request served by the same worker.
/// With more than one worker the counts diverge - workers share nothing.
struct Counter;

impl Application for Counter {
    async fn call(
        &self,
        scope: Scope,
        mut receiver: Receiver,
        sender: Sender,
    ) -> Result<(), AppError> {
        match &scope {
            Scope::Lifespan(_) => loop {
                match receiver.receive().await {
                    Some(ServerEvent::LifespanStartup) => {
                        scope.state().insert("count", 0u64);
                        sender.send(AppEvent::StartupComplete).await?;
                    }
                    Some(ServerEvent::LifespanShutdown) => {
                        let total = scope.state().get::<u64>("count").unwrap_or(0);
                        tracing::info!(total, "worker served");
                        sender.send(AppEvent::ShutdownComplete).await?;
                        return Ok(());
                    }
                    _ => return Ok(()),
                }
            },
            Scope::Http(_) => {
                let count = scope
                    .state()
                    .update("count", |c: &mut u64| {
                        *c += 1;
                        *c
                    })
                    .unwrap_or(0);

                let body = format!(r#"{{"count": {count}, "pid": {}}}"#, std::process::id());
                sender
                    .send(AppEvent::HttpResponseStart {
                        status: 200,
                        headers: vec![
                            header("content-type", "application/json"),
                            header("content-length", body.len().to_string()),
                        ],
                        trailers: false,
                    })
                    .await?;
                sender
                    .send(AppEvent::HttpResponseBody {
                        body: Body::Bytes(body.into_bytes()),
                        more: false,
                    })
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn main() -> Result<(), pagi::ServerError> {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind("127.0.0.1:8000")
        .application(|| Counter)
        .worker_limits(WorkerLimits {
            workers: 2,
            max_requests: Some(10_000),
            ..WorkerLimits::default()
        })
        .build()
        .run()
}
