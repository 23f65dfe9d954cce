//! Online cycle detection over the build graph.
//!
//! A single DFS pass, invoked only when the scheduler's quiescence
//! watchdog fires, not on every edge addition (see DESIGN.md for the
//! rationale). Detection can be cancelled mid-pass via [`CycleDetector::stop`]
//! so shutdown stays prompt even mid-traversal over a large graph.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::graph::BuildGraph;
use crate::label::BuildLabel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Ordered path around the cycle; the first and last labels are
    /// identical.
    pub path: Vec<BuildLabel>,
}

impl Cycle {
    pub fn head(&self) -> &BuildLabel {
        &self.path[0]
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Stateless beyond its stop flag: a fresh DFS walk is run on each call
/// to [`check`](CycleDetector::check).
#[derive(Default)]
pub struct CycleDetector {
    stop: AtomicBool,
}

impl CycleDetector {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.stop.store(false, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Runs a DFS over every target currently in `graph`, returning the
    /// first cycle found, or `None` if the graph (as observed) is
    /// acyclic. Returns `None` early if [`stop`](Self::stop) is called
    /// mid-pass; the scheduler interprets that as "inconclusive, try
    /// again later" rather than "proven acyclic".
    pub fn check(&self, graph: &BuildGraph) -> Option<Cycle> {
        let targets = graph.all_targets();
        let mut marks: HashMap<BuildLabel, Mark> = HashMap::new();

        for target in &targets {
            if self.stopped() {
                return None;
            }
            if marks.contains_key(&target.label) {
                continue;
            }
            let mut stack: Vec<BuildLabel> = Vec::new();
            let mut on_stack: HashSet<BuildLabel> = HashSet::new();
            if let Some(cycle) = self.visit(graph, &target.label, &mut marks, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        graph: &BuildGraph,
        label: &BuildLabel,
        marks: &mut HashMap<BuildLabel, Mark>,
        stack: &mut Vec<BuildLabel>,
        on_stack: &mut HashSet<BuildLabel>,
    ) -> Option<Cycle> {
        if self.stopped() {
            return None;
        }
        match marks.get(label) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                // Closing the loop: truncate the stack to the portion
                // from the repeated label onward.
                let start = stack.iter().position(|l| l == label).unwrap_or(0);
                let mut path: Vec<BuildLabel> = stack[start..].to_vec();
                path.push(label.clone());
                return Some(Cycle { path });
            }
            None => {}
        }

        marks.insert(label.clone(), Mark::InProgress);
        stack.push(label.clone());
        on_stack.insert(label.clone());

        if let Some(target) = graph.target(label) {
            for dep in target.dependencies() {
                if let Some(cycle) = self.visit(graph, &dep, marks, stack, on_stack) {
                    return Some(cycle);
                }
                if self.stopped() {
                    return None;
                }
            }
        }

        stack.pop();
        on_stack.remove(label);
        marks.insert(label.clone(), Mark::Done);
        None
    }
}
