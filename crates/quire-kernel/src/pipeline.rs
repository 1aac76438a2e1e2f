//! Action pipeline: ordered checks an action passes before it reaches the document.
//!
//! The pipeline is assembled once when a session is built. Each processor
//! sees the action and either lets it continue (possibly rewritten) or
//! filters it with a reason. A filtered action produces no update and is
//! reported as [`SessionFlow::ActionFiltered`](crate::flows::SessionFlow).

use std::sync::Arc;

use quire_types::Action;

/// What a processor decided.
#[derive(Clone, Debug, PartialEq)]
pub enum Processed {
    /// Pass this (possibly rewritten) action on.
    Continue(Action),
    /// Drop the action.
    Filtered { reason: String },
}

/// One step in the pipeline. Must be pure: no I/O, no session state.
pub trait ActionProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, action: Action) -> Processed;
}

/// Outcome of running the whole pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutcome {
    Accepted(Action),
    Filtered { processor: String, reason: String },
}

/// Ordered list of processors.
#[derive(Clone, Default)]
pub struct ActionPipeline {
    processors: Vec<Arc<dyn ActionProcessor>>,
}

impl ActionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor; processors run in the order they were added.
    pub fn with(mut self, processor: impl ActionProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn run(&self, action: Action) -> PipelineOutcome {
        let mut current = action;
        for processor in &self.processors {
            match processor.process(current) {
                Processed::Continue(next) => current = next,
                Processed::Filtered { reason } => {
                    return PipelineOutcome::Filtered {
                        processor: processor.name().to_string(),
                        reason,
                    };
                }
            }
        }
        PipelineOutcome::Accepted(current)
    }
}

impl std::fmt::Debug for ActionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.processors.iter().map(|p| p.name()).collect();
        f.debug_struct("ActionPipeline")
            .field("processors", &names)
            .finish()
    }
}

// ============================================================================
// Built-in processors
// ============================================================================

/// Filters actions that would put an oversized source into a cell.
#[derive(Clone, Copy, Debug)]
pub struct SourceLimit {
    max_bytes: usize,
}

impl SourceLimit {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    fn largest_source(action: &Action) -> usize {
        match action {
            Action::AddCell { source, .. } => source.len(),
            Action::UpdateCell(edit) => edit.source.as_ref().map_or(0, String::len),
            Action::Composite { sub_actions } => sub_actions
                .iter()
                .map(Self::largest_source)
                .max()
                .unwrap_or(0),
            _ => 0,
        }
    }
}

impl ActionProcessor for SourceLimit {
    fn name(&self) -> &str {
        "source_limit"
    }

    fn process(&self, action: Action) -> Processed {
        let size = Self::largest_source(&action);
        if size > self.max_bytes {
            Processed::Filtered {
                reason: format!("source of {size} bytes exceeds limit of {}", self.max_bytes),
            }
        } else {
            Processed::Continue(action)
        }
    }
}
