//! Daemon-side request handling and background port maintenance

pub mod api;
mod cmd_handler;
mod port_counter;
mod port_reaper;
pub mod port_tags;

pub use api::{create_router, AppState};
pub use cmd_handler::{project_to_cni_result, CniCommandHandler, CommandHandler, HandlerError};
pub use port_counter::PortCounter;
pub use port_reaper::{PortReaper, ReapSummary, ReaperConfig, SkipReason};
pub use port_tags::PortTags;
