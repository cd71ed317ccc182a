//! Per-process lifespan rendezvous: startup before the acceptor opens,
//! shutdown during drain, shared state in between.

use crate::{
    app::{Application, Receiver, Sender},
    errors::LifespanFailure,
    events::{AppEvent, ServerEvent},
    scope::{Extensions, LifespanScope, PagiInfo, Scope, ScopeCommon, SchedulerHandle, State},
    server::adapter::SenderCore,
};
use std::rc::Rc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// A live lifespan conversation, kept open between startup and shutdown.
pub(crate) struct Lifespan {
    events: mpsc::Sender<ServerEvent>,
    replies: mpsc::UnboundedReceiver<AppEvent>,
    task: JoinHandle<Result<(), crate::app::AppError>>,
}

/// Runs the startup rendezvous.
///
/// `Ok(Some(_))` means the application completed startup and expects a
/// shutdown rendezvous later. `Ok(None)` means the application does not
/// implement lifespan (its call returned without replying): startup is
/// trivially complete and shutdown is skipped. `Err(_)` aborts the worker.
pub(crate) async fn startup<A: Application>(
    app: &Rc<A>,
    state: &State,
    scheduler: &SchedulerHandle,
) -> Result<Option<Lifespan>, LifespanFailure> {
    let (event_tx, event_rx) = mpsc::channel(2);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    let scope = Scope::Lifespan(LifespanScope {
        common: ScopeCommon {
            pagi: PagiInfo::new(scheduler.clone()),
            state: state.clone(),
            extensions: Rc::new(Extensions::default()),
        },
    });

    event_tx
        .send(ServerEvent::LifespanStartup)
        .await
        .expect("fresh lifespan channel");

    let app = app.clone();
    let mut task = tokio::task::spawn_local(async move {
        app.call(
            scope,
            Receiver::new(event_rx),
            Sender {
                core: Rc::new(SenderCore::lifespan(reply_tx)),
            },
        )
        .await
    });

    loop {
        tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(AppEvent::StartupComplete) => {
                    info!("lifespan startup complete");
                    return Ok(Some(Lifespan {
                        events: event_tx,
                        replies: reply_rx,
                        task,
                    }));
                }
                Some(AppEvent::StartupFailed { message }) => {
                    return Err(LifespanFailure::Startup(message));
                }
                Some(other) => {
                    debug!(event = other.name(), "unexpected lifespan reply before startup");
                }
                None => {}
            },
            result = &mut task => {
                // The application finished its lifespan call without a
                // reply: it does not speak lifespan.
                match result {
                    Ok(Ok(())) => debug!("application rejected the lifespan scope"),
                    Ok(Err(e)) => debug!("lifespan call errored before startup: {e}"),
                    Err(e) => {
                        return Err(LifespanFailure::Task(e.to_string()));
                    }
                }
                return Ok(None);
            }
        }
    }
}

impl Lifespan {
    /// Runs the shutdown rendezvous: sends `lifespan.shutdown`, waits for
    /// the completion reply (or the application task ending).
    pub(crate) async fn shutdown(mut self) {
        if self.events.send(ServerEvent::LifespanShutdown).await.is_err() {
            warn!("lifespan receiver dropped before shutdown");
            return;
        }

        loop {
            tokio::select! {
                reply = self.replies.recv() => match reply {
                    Some(AppEvent::ShutdownComplete) => {
                        info!("lifespan shutdown complete");
                        break;
                    }
                    Some(other) => {
                        debug!(event = other.name(), "unexpected lifespan reply during shutdown");
                    }
                    None => break,
                },
                result = &mut self.task => {
                    if let Ok(Err(e)) = result {
                        warn!("lifespan task errored during shutdown: {e}");
                    }
                    return;
                }
            }
        }

        // Let the application's lifespan call wind down.
        let _ = (&mut self.task).await;
    }
}

#[cfg(test)]
mod rendezvous {
    use super::*;
    use crate::{
        app::AppError, blocking::BlockingPool, limits::BlockingLimits, scope::ScopeKind,
    };

    fn scheduler() -> SchedulerHandle {
        SchedulerHandle::new(BlockingPool::new(BlockingLimits::default()))
    }

    async fn in_local<F: std::future::Future>(future: F) -> F::Output {
        tokio::task::LocalSet::new().run_until(future).await
    }

    struct FullLifespanApp;

    impl Application for FullLifespanApp {
        async fn call(
            &self,
            scope: Scope,
            mut receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            assert_eq!(scope.kind(), ScopeKind::Lifespan);
            loop {
                match receiver.receive().await {
                    Some(ServerEvent::LifespanStartup) => {
                        scope.state().insert("ready", true);
                        sender.send(AppEvent::StartupComplete).await?;
                    }
                    Some(ServerEvent::LifespanShutdown) => {
                        sender.send(AppEvent::ShutdownComplete).await?;
                        return Ok(());
                    }
                    None => return Ok(()),
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn full_round_trip_shares_state() {
        in_local(async {
            let state = State::new();
            let app = Rc::new(FullLifespanApp);
            let session = startup(&app, &state, &scheduler()).await.unwrap();

            // Startup mutations are visible through the same container.
            assert_eq!(state.get::<bool>("ready"), Some(true));

            session.expect("lifespan supported").shutdown().await;
        })
        .await;
    }

    struct NoLifespanApp;

    impl Application for NoLifespanApp {
        async fn call(&self, _: Scope, _: Receiver, _: Sender) -> Result<(), AppError> {
            // Returning without replying rejects the scope.
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_lifespan_is_trivially_complete() {
        in_local(async {
            let app = Rc::new(NoLifespanApp);
            let session = startup(&app, &State::new(), &scheduler()).await.unwrap();
            assert!(session.is_none());
        })
        .await;
    }

    struct FailingApp;

    impl Application for FailingApp {
        async fn call(
            &self,
            _: Scope,
            mut receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            assert!(matches!(
                receiver.receive().await,
                Some(ServerEvent::LifespanStartup)
            ));
            sender
                .send(AppEvent::StartupFailed {
                    message: "no database".into(),
                })
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn startup_failure_escalates() {
        in_local(async {
            let app = Rc::new(FailingApp);
            match startup(&app, &State::new(), &scheduler()).await {
                Err(LifespanFailure::Startup(message)) => assert_eq!(message, "no database"),
                Err(other) => panic!("unexpected failure: {other}"),
                Ok(_) => panic!("expected startup failure"),
            }
        })
        .await;
    }
}
