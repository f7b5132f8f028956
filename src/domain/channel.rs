//! Channel entity and its observed-state machine (spec §3, §4.7.1).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Unknown,
}

impl ObservedState {
    /// Mirrors the worker state machine of spec §4.7.1 (placeholder/paused collapse
    /// into `Running` at the Channel level — they are sub-states of "worker is up").
    pub fn can_transition_to(&self, next: ObservedState) -> bool {
        use ObservedState::*;
        matches!(
            (*self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Stopping)
                | (Error, Stopped)
                | (Unknown, Starting)
                | (Unknown, Stopped)
                | (Unknown, Error)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub account_id: String,
    pub target_chat_id: String,
    pub display_name: String,
    pub stream_kind: StreamKind,
    pub encoder_params: String,
    pub placeholder_media_ref: Option<String>,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
}

impl Channel {
    pub fn transition_observed_to(&mut self, next: ObservedState) -> Result<()> {
        if !self.observed_state.can_transition_to(next) {
            return Err(Error::invalid_transition(
                "Channel.observed_state",
                format!("{:?}", self.observed_state),
                format!("{:?}", next),
            ));
        }
        self.observed_state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_to_running_to_stopping_to_stopped() {
        let mut c = Channel {
            id: "ch-1".into(),
            account_id: "acc-1".into(),
            target_chat_id: "-100123".into(),
            display_name: "Lobby".into(),
            stream_kind: StreamKind::Audio,
            encoder_params: String::new(),
            placeholder_media_ref: None,
            desired_state: DesiredState::Stopped,
            observed_state: ObservedState::Stopped,
        };
        c.transition_observed_to(ObservedState::Starting).unwrap();
        c.transition_observed_to(ObservedState::Running).unwrap();
        c.transition_observed_to(ObservedState::Stopping).unwrap();
        c.transition_observed_to(ObservedState::Stopped).unwrap();
        assert!(c.transition_observed_to(ObservedState::Running).is_err());
    }
}
