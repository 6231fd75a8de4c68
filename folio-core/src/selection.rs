//! Deferred selection of an annotation named before its canvas has loaded.

use serde::{Deserialize, Serialize};

use crate::model::Annotation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPhase {
    #[default]
    Idle,
    Pending,
    WaitingViewer,
    WaitingAnnotations,
    Selected,
    Failed,
}

/// Everything outside the selection state that a transition depends on.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInputs<'a> {
    pub viewer_ready: bool,
    pub canvas_id: Option<&'a str>,
    /// Canvas the loaded `annotations` belong to.
    pub annotations_for_canvas_id: Option<&'a str>,
    pub annotations: &'a [Annotation],
    pub annotations_loading: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Unchanged,
    Phase(SelectionPhase),
    Selected(Annotation),
    Failed { annotation_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    phase: SelectionPhase,
    pending_annotation_id: Option<String>,
    selected: Option<Annotation>,
}

impl SelectionState {
    pub fn phase(&self) -> SelectionPhase {
        self.phase
    }

    pub fn pending_annotation_id(&self) -> Option<&str> {
        self.pending_annotation_id.as_deref()
    }

    pub fn selected(&self) -> Option<&Annotation> {
        self.selected.as_ref()
    }

    /// Starts a new selection request, replacing any earlier one.
    pub fn request(&mut self, annotation_id: impl Into<String>) {
        self.pending_annotation_id = Some(annotation_id.into());
        self.phase = SelectionPhase::Pending;
        self.selected = None;
    }

    /// Drops a pending request, e.g. when the user navigates elsewhere.
    /// Returns whether there was one.
    pub fn discard_pending(&mut self) -> bool {
        self.pending_annotation_id.take().is_some()
    }

    /// Back to `Idle` with nothing pending or selected.
    pub fn reset(&mut self) -> bool {
        let changed = *self != Self::default();
        *self = Self::default();
        changed
    }

    pub fn clear_selection(&mut self) -> bool {
        self.selected.take().is_some()
    }

    /// Writes `outcome`; returns whether anything changed.
    pub fn apply(&mut self, outcome: SelectionOutcome) -> bool {
        match outcome {
            SelectionOutcome::Unchanged => false,
            SelectionOutcome::Phase(phase) => {
                let changed = self.phase != phase;
                self.phase = phase;
                changed
            }
            SelectionOutcome::Selected(annotation) => {
                self.phase = SelectionPhase::Selected;
                self.pending_annotation_id = None;
                self.selected = Some(annotation);
                true
            }
            SelectionOutcome::Failed { .. } => {
                self.phase = SelectionPhase::Failed;
                self.pending_annotation_id = None;
                true
            }
        }
    }
}

pub fn evaluate(state: &SelectionState, inputs: &SelectionInputs<'_>) -> SelectionOutcome {
    let phase_if_changed = |next: SelectionPhase| {
        if state.phase == next {
            SelectionOutcome::Unchanged
        } else {
            SelectionOutcome::Phase(next)
        }
    };

    let Some(pending) = state.pending_annotation_id.as_deref() else {
        if state.phase == SelectionPhase::Selected {
            return SelectionOutcome::Unchanged;
        }
        return phase_if_changed(SelectionPhase::Idle);
    };

    if !inputs.viewer_ready {
        return phase_if_changed(SelectionPhase::WaitingViewer);
    }

    if inputs.canvas_id.is_none() || inputs.annotations_for_canvas_id != inputs.canvas_id {
        return phase_if_changed(SelectionPhase::WaitingAnnotations);
    }

    if inputs.annotations.is_empty() {
        if inputs.annotations_loading {
            return phase_if_changed(SelectionPhase::WaitingAnnotations);
        }
        return SelectionOutcome::Failed {
            annotation_id: pending.to_owned(),
        };
    }

    match inputs.annotations.iter().find(|a| a.id == pending) {
        Some(annotation) => SelectionOutcome::Selected(annotation.clone()),
        None => SelectionOutcome::Failed {
            annotation_id: pending.to_owned(),
        },
    }
}
