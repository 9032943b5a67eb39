//! Executors for the message-sending node types.
//!
//! Delivery is best-effort: a transport error is logged and the flow keeps
//! going. A contact with a broken send should not end up with a dead flow.

use crate::domain::flow_definition::{
    AddButtonsData, GetUserInputData, Handle, SendImageData, SendMessageData,
};
use crate::executors::{NodeContext, NodeOutcome, WaitKind};
use crate::interpolate;
use crate::EngineError;

pub(super) async fn send_message(
    data: &SendMessageData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    let text = interpolate::render(&data.text, &ctx.execution.variables);
    if let Err(err) = ctx
        .transport
        .send_text(&ctx.execution.contact_id, &text)
        .await
    {
        tracing::warn!(
            execution_id = %ctx.execution.id,
            error = %err,
            "Text delivery failed, continuing"
        );
    }
    Ok(NodeOutcome::Next(Handle::Main))
}

pub(super) async fn send_image(
    data: &SendImageData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    let url = interpolate::render(&data.image_url, &ctx.execution.variables);
    let caption = data
        .caption
        .as_ref()
        .map(|c| interpolate::render(c, &ctx.execution.variables));
    if let Err(err) = ctx
        .transport
        .send_media(&ctx.execution.contact_id, &url, caption.as_deref())
        .await
    {
        tracing::warn!(
            execution_id = %ctx.execution.id,
            error = %err,
            "Image delivery failed, continuing"
        );
    }
    Ok(NodeOutcome::Next(Handle::Main))
}

pub(super) async fn show_buttons(
    data: &AddButtonsData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    let text = interpolate::render(&data.text, &ctx.execution.variables);
    let labels: Vec<String> = data
        .buttons
        .iter()
        .map(|b| interpolate::render(&b.text, &ctx.execution.variables))
        .collect();
    if let Err(err) = ctx
        .transport
        .send_buttons(&ctx.execution.contact_id, &text, &labels)
        .await
    {
        tracing::warn!(
            execution_id = %ctx.execution.id,
            error = %err,
            "Button message delivery failed, still waiting for a tap"
        );
    }
    Ok(NodeOutcome::Suspend(WaitKind::Button))
}

pub(super) async fn ask_input(
    data: &GetUserInputData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    let text = interpolate::render(&data.text, &ctx.execution.variables);
    if let Err(err) = ctx
        .transport
        .send_text(&ctx.execution.contact_id, &text)
        .await
    {
        tracing::warn!(
            execution_id = %ctx.execution.id,
            error = %err,
            "Question delivery failed, still waiting for a reply"
        );
    }
    Ok(NodeOutcome::Suspend(WaitKind::Reply))
}
