//! Prompt detection over accumulated program output

use coderun_common::DetectorConfig;

/// What a marker match says about the running program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Blocked waiting for a line of input
    AwaitingInput,
    /// Printed a result or termination cue
    Completed,
}

/// Substring scan for configurable prompt and completion markers
#[derive(Debug, Clone)]
pub struct PromptDetector {
    input_markers: Vec<String>,
    completion_markers: Vec<String>,
    longest: usize,
}

impl PromptDetector {
    pub fn new(input_markers: Vec<String>, completion_markers: Vec<String>) -> Self {
        let longest = input_markers
            .iter()
            .chain(completion_markers.iter())
            .map(String::len)
            .max()
            .unwrap_or(0);
        Self {
            input_markers,
            completion_markers,
            longest,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            config.input_markers.clone(),
            config.completion_markers.clone(),
        )
    }

    /// True when an input marker is present
    pub fn requires_input(&self, text: &str) -> bool {
        contains_any(text, &self.input_markers)
    }

    /// First verdict found in `text`; input markers win over completion markers
    pub fn detect(&self, text: &str) -> Option<Detection> {
        if contains_any(text, &self.input_markers) {
            Some(Detection::AwaitingInput)
        } else if contains_any(text, &self.completion_markers) {
            Some(Detection::Completed)
        } else {
            None
        }
    }

    /// Like [`detect`](Self::detect) but only looks at text that could hold a
    /// marker not already visible in `text[..scanned]`.
    pub fn detect_from(&self, text: &str, scanned: usize) -> Option<Detection> {
        if self.longest == 0 {
            return None;
        }
        let mut start = scanned.saturating_sub(self.longest - 1).min(text.len());
        while !text.is_char_boundary(start) {
            start -= 1;
        }
        self.detect(&text[start..])
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

fn contains_any(text: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| text.contains(marker.as_str()))
}
