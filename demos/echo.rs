use pagi::{
    AppError, AppEvent, Application, Body, Receiver, Scope, Sender, Server, ServerEvent, header,
};

/// Streams the request body straight back, chunk for chunk.
struct Echo;

impl Application for Echo {
    async fn call(
        &self,
        scope: Scope,
        mut receiver: Receiver,
        sender: Sender,
    ) -> Result<(), AppError> {
        let Scope::Http(_) = scope else { return Ok(()) };

        sender
            .send(AppEvent::HttpResponseStart {
                status: 200,
                headers: vec![header("content-type", "application/octet-stream")],
                trailers: false,
            })
            .await?;

        while let Some(event) = receiver.receive().await {
            match event {
                ServerEvent::HttpRequest { body, more } => {
                    sender
                        .send(AppEvent::HttpResponseBody {
                            body: Body::Bytes(body),
                            more,
                        })
                        .await?;
                    if !more {
                        break;
                    }
                }
                ServerEvent::HttpDisconnect => break,
                _ => break,
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), pagi::ServerError> {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind("127.0.0.1:8000")
        .application(|| Echo)
        .build()
        .run()
}
