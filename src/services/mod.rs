pub mod inference;
pub mod notifier;
pub mod priority_queue;
pub mod reconciler;
pub mod scheduler;
pub mod state_machine;
