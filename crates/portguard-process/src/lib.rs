/// Lifecycle of the supervised server process.
///
/// `Exited` is momentary: the monitor records it between detecting the exit
/// and applying the restart policy, so external observers may see it briefly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Exited,
}

impl ProcessState {
    /// Whether a live child handle may exist in this state.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

/// Read model returned by the supervisor's `status()`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SupervisorStatus {
    pub port: u16,
    pub state: ProcessState,
    pub restart_count: u32,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// When the last child exit was recorded, if any.
    pub exited_at: Option<chrono::DateTime<chrono::Utc>>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_stable_on_the_wire() {
        // `status` CLI output is JSON; renaming a variant is a breaking change.
        let names: Vec<String> = [
            ProcessState::Stopped,
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Stopping,
            ProcessState::Exited,
        ]
        .iter()
        .map(|s| serde_json::to_string(s).unwrap())
        .collect();
        assert_eq!(
            names,
            vec![
                "\"Stopped\"",
                "\"Starting\"",
                "\"Running\"",
                "\"Stopping\"",
                "\"Exited\"",
            ]
        );
    }

    #[test]
    fn live_states() {
        assert!(!ProcessState::Stopped.is_live());
        assert!(ProcessState::Running.is_live());
        assert!(ProcessState::Stopping.is_live());
        assert!(!ProcessState::Exited.is_live());
    }

    #[test]
    fn status_round_trips() {
        let st = SupervisorStatus {
            port: 4900,
            state: ProcessState::Running,
            restart_count: 3,
            pid: Some(4242),
            exit_code: None,
            exited_at: None,
            message: None,
        };
        let json = serde_json::to_string(&st).unwrap();
        let back: SupervisorStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 4900);
        assert_eq!(back.restart_count, 3);
        assert_eq!(back.state, ProcessState::Running);
    }
}
