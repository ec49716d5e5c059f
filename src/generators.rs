//! Default architect/manager generators for the CLI entry point.
//!
//! The spec treats the area/ticket generator LLM backends as external
//! collaborators behind an injected-function seam (§9) — out of scope for
//! this crate beyond the seam itself. The CLI wires in stubs that raise
//! [`Error::BackendUnimplemented`]; a real deployment supplies its own
//! [`crate::orchestrator::ArchitectGenerator`] / `ManagerGenerator`.

use crate::error::{Error, Result};
use crate::orchestrator::{AreaDoc, ArchitectGenerator, ManagerGenerator, TicketDoc};
use async_trait::async_trait;

pub struct UnimplementedArchitect;

#[async_trait]
impl ArchitectGenerator for UnimplementedArchitect {
    async fn generate_areas(&self, _model: &str, _spec: &str) -> Result<Vec<AreaDoc>> {
        Err(Error::BackendUnimplemented("architect generator".to_string()))
    }
}

pub struct UnimplementedManager;

#[async_trait]
impl ManagerGenerator for UnimplementedManager {
    async fn generate_tickets(&self, _model: &str, _area_path: &str, _area_content: &str) -> Result<Vec<TicketDoc>> {
        Err(Error::BackendUnimplemented("manager generator".to_string()))
    }
}
