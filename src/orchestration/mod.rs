//! Orchestration core.
//!
//! The shared registry ([`state::StateManager`]), the synchronous event
//! channel ([`events::EventBus`]), the delegation/intention protocol
//! ([`delegation::DelegationProtocol`]) and the concurrent worker dispatcher
//! ([`dispatcher::WorkerDispatcher`]), plus the shared [`types`].

pub mod delegation;
pub mod dispatcher;
pub mod event_log;
pub mod events;
pub mod state;
pub mod types;
