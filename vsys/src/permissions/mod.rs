//! Capability-based permissions for vsys
//!
//! Every fs, net, env and process operation, and every module load, is
//! turned into a [`CapabilityRequest`] and checked against the shared
//! [`PermissionStore`] before any backend is touched.

pub mod capability;
pub mod policy;
pub mod prompt;
pub mod rule;
pub mod store;

pub use capability::{CapabilityKind, CapabilityRequest, Domain, Scope};
pub use policy::{BlackOrWhiteList, Permissions, RuleConfig};
pub use prompt::{ChannelPrompt, FnPrompt, PendingPrompt, PromptAnswer, PromptHandler};
pub use rule::{
    Decision, DefaultPosture, HostPattern, PermissionRule, RuleDecision, RuleSet, ScopePattern,
};
pub use store::PermissionStore;
