use serde::{Deserialize, Serialize};

/// How a provider reports token usage over a stream: running totals that
/// replace the previous values, or per-event deltas that add to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMode {
    Cumulative,
    Incremental,
}

/// Running input/output token counts for one call. The mode is fixed at
/// construction from the adapter that owns the call and never changes
/// mid-stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenCounter {
    pub input: u64,
    pub output: u64,
    mode: UsageMode,
}

impl TokenCounter {
    pub fn new(mode: UsageMode) -> Self {
        Self {
            input: 0,
            output: 0,
            mode,
        }
    }

    pub fn mode(&self) -> UsageMode {
        self.mode
    }

    /// Applies one usage report. Absent fields leave the previous value in
    /// place, since several backends report input and output in different
    /// frames.
    pub fn record(&mut self, input: Option<u64>, output: Option<u64>) {
        match self.mode {
            UsageMode::Cumulative => {
                if let Some(input) = input {
                    self.input = input;
                }
                if let Some(output) = output {
                    self.output = output;
                }
            }
            UsageMode::Incremental => {
                self.input += input.unwrap_or(0);
                self.output += output.unwrap_or(0);
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_mode_replaces_values() {
        let mut counter = TokenCounter::new(UsageMode::Cumulative);
        counter.record(Some(10), Some(5));
        counter.record(Some(15), Some(9));
        assert_eq!((counter.input, counter.output), (15, 9));
    }

    #[test]
    fn incremental_mode_adds_values() {
        let mut counter = TokenCounter::new(UsageMode::Incremental);
        counter.record(Some(10), Some(5));
        counter.record(Some(15), Some(9));
        assert_eq!((counter.input, counter.output), (25, 14));
    }

    #[test]
    fn missing_fields_keep_previous_values_in_cumulative_mode() {
        let mut counter = TokenCounter::new(UsageMode::Cumulative);
        counter.record(Some(12), None);
        counter.record(None, Some(7));
        assert_eq!((counter.input, counter.output), (12, 7));
    }
}
