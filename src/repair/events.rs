use std::sync::Mutex;

use anvil_common::{BuildAttempt, BuildIteration, BuildState, Diagnostic, ImplementationPlan, Outcome, SnapshotId};
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// Progress of one build attempt, emitted as the controller moves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BuildEvent {
    StateEntered {
        attempt_id: Uuid,
        factory_id: i64,
        state: BuildState,
        iteration: u32,
    },
    PlanReady {
        attempt_id: Uuid,
        factory_id: i64,
        plan: ImplementationPlan,
    },
    IterationRecorded {
        attempt_id: Uuid,
        factory_id: i64,
        iteration: BuildIteration,
    },
    Finished {
        attempt_id: Uuid,
        factory_id: i64,
        outcome: Outcome,
        iteration_count: u32,
        final_snapshot_id: Option<SnapshotId>,
        final_diagnostics: Vec<Diagnostic>,
        error: Option<String>,
    },
}

impl BuildEvent {
    pub fn attempt_id(&self) -> Uuid {
        match self {
            Self::StateEntered { attempt_id, .. }
            | Self::PlanReady { attempt_id, .. }
            | Self::IterationRecorded { attempt_id, .. }
            | Self::Finished { attempt_id, .. } => *attempt_id,
        }
    }

    pub fn finished(attempt: &BuildAttempt) -> Self {
        Self::Finished {
            attempt_id: attempt.id,
            factory_id: attempt.factory_id,
            outcome: attempt.outcome,
            iteration_count: attempt.iteration_count(),
            final_snapshot_id: attempt.final_snapshot_id.clone(),
            final_diagnostics: attempt.final_diagnostics(),
            error: attempt.error.clone(),
        }
    }
}

/// Receives every event together with the attempt as it stands after the
/// change. Called inline; the controller waits for it.
#[async_trait]
pub trait BuildObserver: Send + Sync {
    async fn on_event(&self, attempt: &BuildAttempt, event: &BuildEvent);
}

pub struct NoopObserver;

#[async_trait]
impl BuildObserver for NoopObserver {
    async fn on_event(&self, _attempt: &BuildAttempt, _event: &BuildEvent) {}
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BuildEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BuildObserver for RecordingObserver {
    async fn on_event(&self, _attempt: &BuildAttempt, event: &BuildEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_common::FeatureRequest;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BuildEvent::StateEntered {
            attempt_id: Uuid::nil(),
            factory_id: 4,
            state: BuildState::Validating,
            iteration: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_entered");
        assert_eq!(json["data"]["state"], "validating");
        assert_eq!(json["data"]["factory_id"], 4);
    }

    #[tokio::test]
    async fn test_recording_observer_keeps_order() {
        let mut attempt = BuildAttempt::new(&FeatureRequest::new(1, "x"), 2);
        attempt.finish(Outcome::Cancelled);
        let obs = RecordingObserver::default();
        obs.on_event(&attempt, &BuildEvent::finished(&attempt)).await;
        let events = obs.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attempt_id(), attempt.id);
    }
}
