pub mod fsm_event;
pub mod fsm_state;
pub mod idempotency_record;

pub use fsm_event::{FsmEvent, InitiatedBy};
pub use fsm_state::FsmState;
pub use idempotency_record::IdempotencyRecord;
