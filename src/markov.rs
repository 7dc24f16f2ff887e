//! Discrete hidden Markov model over file categories.
//!
//! States are the closed category set; observations are the virtual paths
//! seen in training sequences. Training tallies transition and emission
//! counts from category-labelled access sequences and normalises rows;
//! inference runs a forward pass and predicts likely next paths.

use std::collections::HashMap;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    Code,
    Document,
    Config,
    Script,
    Test,
    Misc,
}

pub const CATEGORIES: [FileCategory; 6] = [
    FileCategory::Code,
    FileCategory::Document,
    FileCategory::Config,
    FileCategory::Script,
    FileCategory::Test,
    FileCategory::Misc,
];

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Code => "code",
            FileCategory::Document => "document",
            FileCategory::Config => "config",
            FileCategory::Script => "script",
            FileCategory::Test => "test",
            FileCategory::Misc => "misc",
        }
    }

    fn index(&self) -> usize {
        CATEGORIES.iter().position(|c| c == self).unwrap()
    }
}

/// Deterministic category inference from a path. Keyword matches take
/// precedence over the extension map; unknown shapes fall back to Misc.
pub fn infer_category(path: &str) -> FileCategory {
    let lower = path.to_lowercase();

    if lower.contains("test") {
        return FileCategory::Test;
    }
    if lower.contains("doc") {
        return FileCategory::Document;
    }
    if lower.contains("conf") {
        return FileCategory::Config;
    }

    match lower.rsplit('.').next() {
        Some("cpp" | "hpp" | "c" | "h" | "rs") => FileCategory::Code,
        Some("txt" | "md") => FileCategory::Document,
        Some("json" | "xml" | "yaml") => FileCategory::Config,
        Some("py" | "js" | "java") => FileCategory::Script,
        _ => FileCategory::Misc,
    }
}

const PREDICTION_THRESHOLD: f64 = 0.01;

pub struct HiddenMarkovModel {
    observations: Vec<String>,
    obs_index: HashMap<String, usize>,
    /// `transition[i][j]`: probability of category j following category i.
    transition: Vec<Vec<f64>>,
    /// `emission[i][o]`: probability of observing path o in category i.
    emission: Vec<Vec<f64>>,
    initial: Vec<f64>,
    sequences: Vec<Vec<String>>,
    trained: bool,
}

impl HiddenMarkovModel {
    pub fn new() -> Self {
        Self {
            observations: Vec::new(),
            obs_index: HashMap::new(),
            transition: Vec::new(),
            emission: Vec::new(),
            initial: Vec::new(),
            sequences: Vec::new(),
            trained: false,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    pub fn add_sequence(&mut self, sequence: Vec<String>) {
        for obs in &sequence {
            if !self.obs_index.contains_key(obs) {
                self.obs_index.insert(obs.clone(), self.observations.len());
                self.observations.push(obs.clone());
            }
        }
        self.sequences.push(sequence);
    }

    /// Tally transition and emission counts across all recorded sequences,
    /// then normalise rows. Rows never touched by training stay all-zero.
    pub fn train(&mut self) {
        if self.observations.is_empty() {
            warn!("HMM train skipped: no observations recorded");
            return;
        }

        let num_states = CATEGORIES.len();
        let num_obs = self.observations.len();

        let mut trans_counts = vec![vec![0u64; num_states]; num_states];
        let mut emit_counts = vec![vec![0u64; num_obs]; num_states];
        let mut state_counts = vec![0u64; num_states];

        for sequence in &self.sequences {
            let mut prev_state: Option<usize> = None;
            for obs in sequence {
                let state = infer_category(obs).index();
                let obs_idx = self.obs_index[obs];
                emit_counts[state][obs_idx] += 1;
                state_counts[state] += 1;
                if let Some(prev) = prev_state {
                    trans_counts[prev][state] += 1;
                }
                prev_state = Some(state);
            }
        }

        self.transition = vec![vec![0.0; num_states]; num_states];
        self.emission = vec![vec![0.0; num_obs]; num_states];
        self.initial = vec![1.0 / num_states as f64; num_states];

        for i in 0..num_states {
            let total_trans: u64 = trans_counts[i].iter().sum();
            if total_trans > 0 {
                for j in 0..num_states {
                    self.transition[i][j] = trans_counts[i][j] as f64 / total_trans as f64;
                }
            }
            if state_counts[i] > 0 {
                for o in 0..num_obs {
                    self.emission[i][o] = emit_counts[i][o] as f64 / state_counts[i] as f64;
                }
            }
        }

        self.trained = true;
        info!(
            states = num_states,
            observations = num_obs,
            sequences = self.sequences.len(),
            "HMM trained"
        );
    }

    /// Forward pass: propagate the initial distribution through the
    /// transition and emission matrices along the observed paths. Unknown
    /// observations are skipped.
    pub fn forward_probs(&self, observed: &[String]) -> Vec<f64> {
        let num_states = CATEGORIES.len();
        if !self.trained || observed.is_empty() {
            return vec![1.0 / num_states as f64; num_states];
        }
        let mut probs = self.initial.clone();

        for obs in observed {
            let Some(&obs_idx) = self.obs_index.get(obs) else {
                continue;
            };

            let mut next = vec![0.0; num_states];
            for (j, next_prob) in next.iter_mut().enumerate() {
                for (i, prob) in probs.iter().enumerate() {
                    *next_prob += prob * self.transition[i][j] * self.emission[j][obs_idx];
                }
            }

            let sum: f64 = next.iter().sum();
            if sum > 0.0 {
                for p in &mut next {
                    *p /= sum;
                }
            }
            probs = next;
        }

        probs
    }

    /// Predict likely next paths given the recent observation list. The
    /// posterior is advanced one transition step before emissions are
    /// applied, so the scores describe the step after the observed prefix.
    pub fn predict_next(&self, recent: &[String], k: usize) -> Vec<String> {
        if recent.is_empty() || !self.trained {
            return Vec::new();
        }

        let state_probs = self.forward_probs(recent);
        let num_states = CATEGORIES.len();

        let mut next_state = vec![0.0; num_states];
        for (j, next_prob) in next_state.iter_mut().enumerate() {
            for (i, prob) in state_probs.iter().enumerate() {
                *next_prob += prob * self.transition[i][j];
            }
        }

        let mut predictions: Vec<(usize, f64)> = Vec::new();
        for (s, state_prob) in next_state.iter().enumerate() {
            for (o, emit) in self.emission[s].iter().enumerate() {
                let prob = state_prob * emit;
                if prob > PREDICTION_THRESHOLD {
                    predictions.push((o, prob));
                }
            }
        }

        predictions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut result = Vec::new();
        for (obs_idx, _) in predictions {
            let path = &self.observations[obs_idx];
            if !result.contains(path) {
                result.push(path.clone());
            }
            if result.len() == k {
                break;
            }
        }
        result
    }

    /// Classify a path in the context of recent observations: the category
    /// maximising `P(state | context) * B[state][path]`, or the posterior
    /// argmax when the path was never observed in training. An untrained
    /// model falls back to static inference.
    pub fn classify(&self, path: &str, context: &[String]) -> FileCategory {
        if !self.trained {
            return infer_category(path);
        }

        let state_probs = self.forward_probs(context);

        if let Some(&obs_idx) = self.obs_index.get(path) {
            let best = (0..CATEGORIES.len())
                .max_by(|a, b| {
                    let pa = state_probs[*a] * self.emission[*a][obs_idx];
                    let pb = state_probs[*b] * self.emission[*b][obs_idx];
                    pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0);
            return CATEGORIES[best];
        }

        let best = (0..CATEGORIES.len())
            .max_by(|a, b| {
                state_probs[*a]
                    .partial_cmp(&state_probs[*b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(0);
        CATEGORIES[best]
    }

    /// Row sums of the trained matrices, for invariant checks and the
    /// self-test report.
    pub fn row_sums(&self) -> (Vec<f64>, Vec<f64>) {
        let trans = self
            .transition
            .iter()
            .map(|row| row.iter().sum())
            .collect();
        let emit = self.emission.iter().map(|row| row.iter().sum()).collect();
        (trans, emit)
    }
}

impl Default for HiddenMarkovModel {
    fn default() -> Self {
        Self::new()
    }
}
