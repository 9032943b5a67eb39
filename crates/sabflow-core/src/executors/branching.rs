//! Executors for AddCondition and AddDelay nodes.

use crate::condition;
use crate::domain::execution::ExecutionState;
use crate::domain::flow_definition::{AddConditionData, AddDelayData, ConditionType, Handle};
use crate::executors::{NodeContext, NodeOutcome, WaitKind};
use crate::interpolate;
use crate::EngineError;
use std::time::Duration;

pub(super) fn enter_condition(
    data: &AddConditionData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    match data.condition_type {
        ConditionType::UserResponse => {
            // Sends nothing; compares whatever the contact says next
            Ok(NodeOutcome::Suspend(WaitKind::Reply))
        }
        ConditionType::Variable => {
            let variable = match &data.variable {
                Some(v) => v,
                None => {
                    return Ok(NodeOutcome::Fail(
                        "Condition node compares a variable but names none".to_string(),
                    ))
                }
            };
            let left = interpolate::render(variable, &ctx.execution.variables);
            Ok(branch(data, &left, ctx.execution))
        }
    }
}

/// Resume a user-response condition with the contact's reply
pub(super) fn resume_condition(
    data: &AddConditionData,
    reply: &str,
    execution: &mut ExecutionState,
) -> NodeOutcome {
    branch(data, reply, execution)
}

fn branch(data: &AddConditionData, left: &str, execution: &ExecutionState) -> NodeOutcome {
    let right = interpolate::render(&data.value, &execution.variables);
    let result = condition::evaluate(data.operator, left, &right);
    tracing::debug!(
        execution_id = %execution.id,
        operator = ?data.operator,
        left,
        right = %right,
        result,
        "Condition evaluated"
    );
    NodeOutcome::Next(if result { Handle::Yes } else { Handle::No })
}

pub(super) async fn enter_delay(
    data: &AddDelayData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    if data.delay_seconds <= 0.0 {
        // No pause configured; chain straight through
        return Ok(NodeOutcome::Next(Handle::Main));
    }

    // NaN or absurdly large values deserialize fine but make no Duration
    let delay = match Duration::try_from_secs_f64(data.delay_seconds) {
        Ok(delay) => delay,
        Err(_) => {
            return Ok(NodeOutcome::Fail(format!(
                "Delay of {} seconds is not a valid duration",
                data.delay_seconds
            )))
        }
    };

    if data.show_typing {
        if let Err(err) = ctx.transport.send_typing(&ctx.execution.contact_id).await {
            tracing::warn!(
                execution_id = %ctx.execution.id,
                error = %err,
                "Typing indicator failed, continuing"
            );
        }
    }

    Ok(NodeOutcome::Suspend(WaitKind::Delay(delay)))
}
