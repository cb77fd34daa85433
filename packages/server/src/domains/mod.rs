// Business domains
pub mod fallback;
pub mod fsm;
pub mod outbox;
