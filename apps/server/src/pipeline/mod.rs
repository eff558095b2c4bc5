//! Message pipeline: intake, stage sequencing, retries and dead-lettering

pub mod dead_letter;
pub mod intake;
pub mod orchestrator;
pub mod parse;
pub mod retry;
pub mod stage;

pub use dead_letter::{
    DeadLetterKind, DeadLetterRecord, DeadLetterStore, FileDeadLetterStore,
    InMemoryDeadLetterStore, LogNotifier, QuarantineNotifier,
};
pub use intake::{DeliveryOutcome, InboundUnit, Intake, IntakeError, ProcessingOutcome};
pub use orchestrator::{InFlightEntry, Orchestrator, RouteHandle};
pub use retry::RetryPolicy;
pub use stage::Stage;
