//! Domain models for synced mail entities

mod account;
mod backfill;
mod message;
mod thread;

pub use account::{Account, AccountStatus, NewAccount, Provider};
pub use backfill::{BackfillPhase, BackfillProgress, PhaseCounters};
pub use message::{
    AttachmentMeta, EmailAddress, MessageFlags, MessageRecord, Participant, ParticipantRole,
    ProviderMessage, ProviderMessageBuilder,
};
pub use thread::{
    NO_SUBJECT, ProviderThread, ThreadFlags, ThreadRecord, ThreadSummary, union_labels,
};
