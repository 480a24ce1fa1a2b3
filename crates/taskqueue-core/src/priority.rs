//! PriorityScorer: a pure function from (task, wall clock) to a score (§4.3).

use crate::task::Task;
use chrono::{DateTime, Utc};

/// Age window used to normalize the `age` component: a task stops accruing
/// extra age score after 24 hours.
const AGE_WINDOW_HOURS: f64 = 24.0;

/// Total deadline window used to normalize the `deadline` component. A task
/// without a deadline contributes zero to this component.
const DEFAULT_DEADLINE_WINDOW_HOURS: f64 = 24.0;

/// Deadline-component threshold above which a task counts as urgent (§4.3).
const URGENT_DEADLINE_THRESHOLD: f64 = 0.8;

/// Breakdown of a task's composite score, returned so callers (tests, metrics)
/// can inspect each component rather than just the final number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub base: f64,
    pub age: f64,
    pub deadline: f64,
    pub weight: f64,
    pub final_score: f64,
}

/// Compute the composite score for a single task at `now`.
pub fn score(task: &Task, now: DateTime<Utc>) -> Score {
    let base = task.priority.base_score();

    let hours_since_created = (now - task.created).num_milliseconds() as f64 / 3_600_000.0;
    let age = (hours_since_created / AGE_WINDOW_HOURS).clamp(0.0, 1.0);

    let deadline = match task.deadline {
        Some(d) => {
            let total_window_ms = DEFAULT_DEADLINE_WINDOW_HOURS * 3_600_000.0;
            let time_left_ms = (d - now).num_milliseconds() as f64;
            (1.0 - time_left_ms / total_window_ms).clamp(0.0, 1.0)
        }
        None => 0.0,
    };

    let weight = task.weight.unwrap_or(0.5).clamp(0.0, 1.0);

    let final_score = base + 0.1 * age + 0.3 * deadline + 0.2 * weight;

    Score {
        base,
        age,
        deadline,
        weight,
        final_score,
    }
}

/// Sort tasks by `final` score descending, ties broken by `created` ascending.
pub fn sort(tasks: &mut [Task], now: DateTime<Utc>) {
    tasks.sort_by(|a, b| {
        let sa = score(a, now).final_score;
        let sb = score(b, now).final_score;
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.created.cmp(&b.created))
    });
}

/// Tasks that are urgent: priority == Urgent, or deadline-component > 0.8.
pub fn urgent<'a>(tasks: &'a [Task], now: DateTime<Utc>) -> Vec<&'a Task> {
    tasks
        .iter()
        .filter(|t| {
            t.priority == crate::task::Priority::Urgent
                || score(t, now).deadline > URGENT_DEADLINE_THRESHOLD
        })
        .collect()
}

/// Anti-starvation pass: tasks older than half the age window get their
/// weight bumped by 0.1 (capped at 1.0). Called periodically by the scheduler.
pub fn age_weights(tasks: &mut [Task], now: DateTime<Utc>) {
    let half_window = chrono::Duration::milliseconds((AGE_WINDOW_HOURS * 3_600_000.0 / 2.0) as i64);
    for task in tasks.iter_mut() {
        if now - task.created > half_window {
            let current = task.weight.unwrap_or(0.5);
            task.weight = Some((current + 0.1).min(1.0));
        }
    }
}
