use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::orchestrator::PipelineState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    Degraded,
    Skipped,
    Failed,
    Cached,
}

/// Emitted after every pipeline transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub stage: PipelineState,
    pub percent: u8,
    pub status: StageStatus,
    pub message: String,
}

/// Sending half handed to the pipeline. A reporter without a channel drops
/// every event.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender: Some(sender) }, receiver)
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, stage: PipelineState, status: StageStatus, message: impl Into<String>) {
        if let Some(sender) = &self.sender {
            // The receiver going away must not stop the analysis.
            let _ = sender.send(ProgressEvent {
                stage,
                percent: stage.percent(),
                status,
                message: message.into(),
            });
        }
    }
}

/// Renders progress events on stdout.
pub struct ConsoleProgress {
    enabled: bool,
    start_time: Instant,
}

impl ConsoleProgress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            start_time: Instant::now(),
        }
    }

    pub fn render(&self, event: &ProgressEvent) {
        if !self.enabled {
            return;
        }

        match event.status {
            StageStatus::Started => {
                print!("\r🔍 {} [{}] {}% ", event.message, bar(event.percent), event.percent);
            }
            StageStatus::Completed => println!("\r✅ {} ({}%)                    ", event.message, event.percent),
            StageStatus::Degraded => println!("\r⚠️  {}: {}                    ", event.stage.label(), event.message),
            StageStatus::Skipped => println!("\r⏭️  {}: {}                    ", event.stage.label(), event.message),
            StageStatus::Failed => println!("\r❌ {}: {}                    ", event.stage.label(), event.message),
            StageStatus::Cached => println!("\r💾 {}", event.message),
        }
        io::stdout().flush().unwrap_or(());
    }

    pub fn finish(&self, message: &str) {
        if !self.enabled {
            return;
        }
        println!("\r🏁 {} in {:.1}s", message, self.start_time.elapsed().as_secs_f64());
    }
}

fn bar(percent: u8) -> String {
    let bar_width = 20;
    let filled = (percent.min(100) as usize * bar_width) / 100;
    format!("{}{}", "█".repeat(filled), "░".repeat(bar_width - filled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_carry_stage_percent() {
        let (reporter, mut receiver) = ProgressReporter::channel();
        reporter.emit(PipelineState::Parsing, StageStatus::Started, "Parsing");
        reporter.emit(PipelineState::Completed, StageStatus::Completed, "done");
        drop(reporter);

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.stage, PipelineState::Parsing);
        assert_eq!(first.percent, PipelineState::Parsing.percent());
        assert_eq!(receiver.recv().await.unwrap().percent, 100);
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn test_silent_reporter_and_bar() {
        ProgressReporter::silent().emit(PipelineState::Ingesting, StageStatus::Started, "ignored");
        assert_eq!(bar(50).chars().filter(|c| *c == '█').count(), 10);
        assert_eq!(bar(100).chars().count(), 20);
    }
}
