use tracing::info;

use crate::domains::fsm::{FsmState, InitError, InitializeCommand, InitializeHandler, InitializeResult, InitiatedBy};

/// What [`ensure_initialized`] found or did.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    /// The entity was already past its pre-initialization state.
    AlreadyInitialized(FsmState),
    /// The entity was initialized (or the initialization replayed) by this call.
    Initialized(InitializeResult),
}

/// Guard for job consumers that depend on an initialized entity.
///
/// Loads the entity's state. If there is none, or it is still in
/// `pre_initialization_state`, builds the initialization command and submits
/// it as `InitiatedBy::Worker`. `build` is only called when needed.
pub async fn ensure_initialized<F>(
    handler: &InitializeHandler,
    entity_id: &str,
    pre_initialization_state: Option<&str>,
    build: F,
) -> Result<EnsureOutcome, InitError>
where
    F: FnOnce() -> InitializeCommand,
{
    if let Some(state) = FsmState::find_by_entity(entity_id, handler.pool()).await? {
        if state.has_left(pre_initialization_state) {
            return Ok(EnsureOutcome::AlreadyInitialized(state));
        }
    }

    let command = build().with_initiated_by(InitiatedBy::Worker);
    if command.entity_id != entity_id {
        return Err(InitError::Validation(format!(
            "command entity_id {} does not match guarded entity {}",
            command.entity_id, entity_id
        )));
    }

    info!(entity_id = %entity_id, "worker found entity uninitialized, initializing");

    let result = handler.handle(command).await?;
    Ok(EnsureOutcome::Initialized(result))
}
