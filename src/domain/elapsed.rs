/// Per-task stopwatch counting whole seconds while the task is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElapsedCounter {
    /// Seconds accumulated so far (persisted value plus observed ticks)
    pub seconds: u64,
    /// Whether ticks currently add time
    pub running: bool,
    /// Highest value known to be persisted in the store
    pub persisted: u64,
}

impl ElapsedCounter {
    /// Start from the persisted `time_spent` of a task
    pub fn seeded(persisted: u64, is_completed: bool) -> Self {
        Self {
            seconds: persisted,
            running: !is_completed,
            persisted,
        }
    }

    /// Resume counting from the current value
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop counting, keep what has accumulated
    pub fn pause(&mut self) {
        self.running = false;
    }

    /// Add one second if running
    pub fn tick(&mut self) {
        if self.running {
            self.seconds = self.seconds.saturating_add(1);
        }
    }

    /// Adopt a newer persisted value without ever going backwards
    pub fn observe_persisted(&mut self, persisted: u64) {
        self.persisted = self.persisted.max(persisted);
        self.seconds = self.seconds.max(persisted);
    }

    /// Seconds not yet written to the store
    pub fn unsaved(&self) -> u64 {
        self.seconds.saturating_sub(self.persisted)
    }

    /// Mark the current value as written
    pub fn mark_saved(&mut self) {
        self.persisted = self.seconds;
    }

    /// Format as "HH:MM:SS"
    pub fn formatted(&self) -> String {
        format_elapsed(self.seconds)
    }
}

/// Format seconds as "HH:MM:SS" (hours grow past two digits if needed)
pub fn format_elapsed(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}
