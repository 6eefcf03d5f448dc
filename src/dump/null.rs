use super::DumpBackend;
use crate::error::BackendWriteError;
use crate::models::{DumpMode, PacketRecord};

/// Discards every record; used when no export is configured
#[derive(Debug, Default)]
pub struct NullBackend {
    discarded: u64,
}

impl NullBackend {
    pub const fn new() -> Self {
        Self { discarded: 0 }
    }
}

impl DumpBackend for NullBackend {
    fn mode(&self) -> DumpMode {
        DumpMode::None
    }

    fn write(&mut self, _record: &PacketRecord) -> Result<(), BackendWriteError> {
        self.discarded += 1;
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), BackendWriteError> {
        tracing::debug!("Null backend discarded {} records", self.discarded);
        Ok(())
    }
}
