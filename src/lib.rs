//! Scanner agent: the on-device control agent for a fleet of Wi-Fi scanners.
//!
//! The agent polls the network management server (NMS) for commands,
//! executes each one and reports exactly one acknowledgment per command.
//!
//! # Architecture
//!
//! Two long-lived loops share one [`AgentContext`]:
//! - **Dispatcher**: poll, schedule by `execute_at`, validate against the
//!   action registry, run the handler under a deadline, ack
//! - **Voice loop**: capture, recognize, wake-word and phrase matching, and
//!   the deaf / name-listen / conversation / LLM mode machine
//!
//! Handlers reach the outside world through narrow seams: [`NmsApi`],
//! [`ServiceManager`], the process tracker's launch specs, and the
//! completion client used in LLM mode.

pub mod actions;
pub mod agent_dirs;
pub mod bundle;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod identity;
pub mod logging;
pub mod nms;
pub mod process;
pub mod services;
pub mod timefmt;
pub mod voice;

pub use config::AgentConfig;
pub use context::AgentContext;
pub use dispatcher::{Dispatcher, TickSummary};
pub use error::{AgentError, Result};
pub use executor::Executor;
pub use nms::{AckResult, Command, HttpNmsClient, NmsApi};
pub use services::{ServiceManager, SystemctlManager};
pub use voice::{VoiceMachine, VoiceMode, VoiceService};
