use pagi::{AppError, AppEvent, Application, Body, Receiver, Scope, Sender, Server, header};

struct HelloWorld;

impl Application for HelloWorld {
    async fn call(
        &self,
        _scope: Scope,
        _receiver: Receiver,
        sender: Sender,
    ) -> Result<(), AppError> {
        sender
            .send(AppEvent::HttpResponseStart {
                status: 200,
                headers: vec![header("content-type", "text/plain")],
                trailers: false,
            })
            .await?;
        sender
            .send(AppEvent::HttpResponseBody {
                body: Body::from("Hello, world!"),
                more: false,
            })
            .await?;
        Ok(())
    }
}

fn main() -> Result<(), pagi::ServerError> {
    tracing_subscriber::fmt::init();

    Server::builder()
        .bind("127.0.0.1:8000")
        .application(|| HelloWorld)
        .build()
        .run()
}
