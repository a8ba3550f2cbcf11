//! Inbound frame handling
//!
//! Frames are handled one at a time, in the order the reader receives
//! them. An update runs to completion before the next frame is read, so at
//! most one update is ever in flight.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::ExitReason;
use crate::metrics::MetricsCollector;
use crate::protocol::{InboundFrame, ServerResponse};
use crate::update::{UpdateHandler, UpdateOutcome};

/// What the reader should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Exit(ExitReason),
}

pub struct CommandDispatcher {
    collector: Arc<dyn MetricsCollector>,
    updater: Arc<dyn UpdateHandler>,
}

impl CommandDispatcher {
    pub fn new(collector: Arc<dyn MetricsCollector>, updater: Arc<dyn UpdateHandler>) -> Self {
        Self { collector, updater }
    }

    pub async fn dispatch(&self, response: ServerResponse) -> Dispatch {
        match response.classify() {
            InboundFrame::Error { message } => {
                warn!(message = %message, "Collector reported an error");
            }
            InboundFrame::Update(command) => {
                info!(
                    download_url = ?command.download_url,
                    force = command.force,
                    "Received update command"
                );
                match self.updater.handle_update(&command).await {
                    Ok(UpdateOutcome::RestartRequested { artifact }) => {
                        info!(sha256 = %artifact.sha256, "Update applied, shutting down for restart");
                        return Dispatch::Exit(ExitReason::Restarting);
                    }
                    Ok(UpdateOutcome::UpToDate { version }) => {
                        debug!(version = %version, "No update needed");
                    }
                    Err(e) => {
                        error!(error = %e, "Self-update failed, continuing on current version");
                    }
                }
            }
            InboundFrame::UnknownCommand(command) => {
                debug!(command = %command, "Ignoring unknown command");
            }
            InboundFrame::Config { ping_targets } => {
                if ping_targets.is_empty() {
                    info!("Ping targets cleared");
                } else {
                    info!(count = ping_targets.len(), "Ping targets updated");
                }
                self.collector.set_ping_targets(ping_targets);
            }
            InboundFrame::Ignored => {}
        }
        Dispatch::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SystemSnapshot;
    use crate::protocol::{PingTargetConfig, UpdateCommand};
    use crate::update::{Artifact, UpdateError};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCollector {
        targets: Mutex<Option<Vec<PingTargetConfig>>>,
    }

    #[async_trait::async_trait]
    impl MetricsCollector for RecordingCollector {
        async fn collect(&self) -> SystemSnapshot {
            SystemSnapshot::default()
        }

        fn set_ping_targets(&self, targets: Vec<PingTargetConfig>) {
            *self.targets.lock().unwrap() = Some(targets);
        }
    }

    struct ScriptedUpdater {
        result: Result<UpdateOutcome, UpdateError>,
        seen: Mutex<Vec<UpdateCommand>>,
    }

    #[async_trait::async_trait]
    impl UpdateHandler for ScriptedUpdater {
        async fn handle_update(
            &self,
            command: &UpdateCommand,
        ) -> Result<UpdateOutcome, UpdateError> {
            self.seen.lock().unwrap().push(command.clone());
            self.result.clone()
        }
    }

    fn dispatcher(
        result: Result<UpdateOutcome, UpdateError>,
    ) -> (CommandDispatcher, Arc<RecordingCollector>, Arc<ScriptedUpdater>) {
        let collector = Arc::new(RecordingCollector::default());
        let updater = Arc::new(ScriptedUpdater {
            result,
            seen: Mutex::new(Vec::new()),
        });
        (
            CommandDispatcher::new(collector.clone(), updater.clone()),
            collector,
            updater,
        )
    }

    fn frame(json: &str) -> ServerResponse {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_config_replaces_and_clears_targets() {
        let (dispatcher, collector, _) = dispatcher(Ok(UpdateOutcome::UpToDate {
            version: "1.0.0".to_string(),
        }));

        let next = dispatcher
            .dispatch(frame(
                r#"{"type":"config","ping_targets":[{"name":"db","host":"10.0.0.9","type":"tcp","port":5432}]}"#,
            ))
            .await;
        assert_eq!(next, Dispatch::Continue);
        let targets = collector.targets.lock().unwrap().clone().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "db");

        dispatcher
            .dispatch(frame(r#"{"type":"config","ping_targets":[]}"#))
            .await;
        assert_eq!(collector.targets.lock().unwrap().clone(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_successful_update_requests_exit() {
        let (dispatcher, _, updater) = dispatcher(Ok(UpdateOutcome::RestartRequested {
            artifact: Artifact {
                size_bytes: 3,
                sha256: "abc".to_string(),
            },
        }));

        let next = dispatcher
            .dispatch(frame(
                r#"{"type":"command","command":"update","force":true}"#,
            ))
            .await;

        assert_eq!(next, Dispatch::Exit(ExitReason::Restarting));
        let seen = updater.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].force);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_running() {
        let (dispatcher, _, _) = dispatcher(Err(UpdateError::DownloadFailed(
            "HTTP 404 Not Found".to_string(),
        )));

        let next = dispatcher
            .dispatch(frame(r#"{"type":"command","command":"update"}"#))
            .await;
        assert_eq!(next, Dispatch::Continue);
    }

    #[tokio::test]
    async fn test_other_frames_are_ignored() {
        let (dispatcher, collector, updater) = dispatcher(Ok(UpdateOutcome::UpToDate {
            version: "1.0.0".to_string(),
        }));

        for json in [
            r#"{"type":"error","message":"rate limited"}"#,
            r#"{"type":"command","command":"reboot"}"#,
            r#"{"type":"ok"}"#,
            r#"{"type":"something-new"}"#,
        ] {
            assert_eq!(dispatcher.dispatch(frame(json)).await, Dispatch::Continue);
        }

        assert!(updater.seen.lock().unwrap().is_empty());
        assert!(collector.targets.lock().unwrap().is_none());
    }
}
