use pagi::{
    AppError, AppEvent, Application, Receiver, Scope, Sender, Server, ServerEvent,
};

/// Accepts every WebSocket and echoes each message back.
struct WsEcho;

impl Application for WsEcho {
    async fn call(
        &self,
        scope: Scope,
        mut receiver: Receiver,
        sender: Sender,
    ) -> Result<(), AppError> {
        let Scope::WebSocket(ws) = &scope else {
            return Ok(());
        };
        // Echo servers speak any offered subprotocol's first choice.
        let subprotocol = ws.subprotocols().first().cloned();

        while let Some(event) = receiver.receive().await {
            match event {
                ServerEvent::WsConnect => {
                    sender
                        .send(AppEvent::WsAccept {
                            subprotocol: subprotocol.clone(),
                            headers: vec![],
                        })
                        .await?;
                }
                ServerEvent::WsReceive(message) => {
                    sender.send(AppEvent::WsSend(message)).await?;
                }
                ServerEvent::WsDisconnect { code } => {
                    tracing::info!(code, "peer closed");
                    break;
                }
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
        .application(|| WsEcho)
        .build()
        .run()
}
