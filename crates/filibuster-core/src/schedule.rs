use filibuster_types::TestExecution;

/// LIFO stack of pending test executions.
///
/// Membership is structural: `contains` compares on the `(log, failures)`
/// value, which is what keeps the scheduler from enqueueing the same
/// execution twice across the orchestration run.
#[derive(Debug, Default)]
pub struct ScheduleStack {
    stack: Vec<TestExecution>,
}

impl ScheduleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, execution: TestExecution) {
        self.stack.push(execution);
    }

    pub fn pop(&mut self) -> Option<TestExecution> {
        self.stack.pop()
    }

    pub fn contains(&self, execution: &TestExecution) -> bool {
        self.stack.contains(execution)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Should `candidate` be enqueued?
///
/// Only when it is new everywhere: not produced earlier in this batch, not
/// already on the stack, not the execution currently running, and not equal
/// to anything that already ran.
pub fn should_schedule(
    candidate: &TestExecution,
    batch: &[TestExecution],
    stack: &ScheduleStack,
    current: Option<&TestExecution>,
    ran: &[TestExecution],
) -> bool {
    !batch.contains(candidate)
        && !stack.contains(candidate)
        && current != Some(candidate)
        && !ran.contains(candidate)
}
