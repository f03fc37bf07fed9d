use super::{Edge, Transport};
use crate::error::Result;
use crate::group::ProcessGroup;

/// Transport that moves nothing.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn setup_send(&mut self, _group: &ProcessGroup, _edge: &Edge) -> Result<()> {
        Ok(())
    }

    fn setup_recv(&mut self, _group: &ProcessGroup, _edge: &Edge) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, _group: &ProcessGroup) -> Result<()> {
        Ok(())
    }

    fn wait(&mut self, _group: &ProcessGroup) -> Result<()> {
        Ok(())
    }
}
